//! ONNX Runtime model backend, enabled with the `onnx` feature.

use std::path::Path;

use ndarray::ArrayD;
use ort::session::Session;
use ort::value::TensorRef;

use invigil_detect::{Model, ModelError, ModelRuntime};

pub struct OrtRuntime;

impl ModelRuntime for OrtRuntime {
    fn load(&self, path: &Path, _device_id: i32) -> Result<Box<dyn Model>, ModelError> {
        // The default CPU execution provider ignores the device id; it is
        // threaded through for accelerator runtimes.
        tracing::info!("loading ONNX model from {}", path.display());
        let session = Session::builder()
            .map_err(|e| ModelError::Load(e.to_string()))?
            .commit_from_file(path)
            .map_err(|e| ModelError::Load(e.to_string()))?;
        Ok(Box::new(OrtModel { session }))
    }
}

struct OrtModel {
    session: Session,
}

impl Model for OrtModel {
    fn infer(&mut self, input: &ArrayD<f32>) -> Result<ArrayD<f32>, ModelError> {
        let tensor =
            TensorRef::from_array_view(input.view()).map_err(|e| ModelError::Infer(e.to_string()))?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .map_err(|e| ModelError::Infer(e.to_string()))?;
        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::Infer(e.to_string()))?;
        let dims: Vec<usize> = shape.iter().map(|d| *d as usize).collect();
        ArrayD::from_shape_vec(ndarray::IxDyn(&dims), data.to_vec())
            .map_err(|e| ModelError::Infer(e.to_string()))
    }
}
