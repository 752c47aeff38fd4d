//! Bundled video backend: replays a directory of still images (or a single
//! image) as a looping video source. Network schemes are left to real
//! capture backends.

use std::path::{Path, PathBuf};

use invigil_engine::{SourceError, VideoBackend, VideoStream};
use invigil_types::Frame;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

#[derive(Default)]
pub struct ImageDirBackend;

impl VideoBackend for ImageDirBackend {
    fn open(&self, uri: &str) -> Result<Box<dyn VideoStream>, SourceError> {
        let path = match uri.split_once("://") {
            None => Path::new(uri),
            Some(("file", rest)) => Path::new(rest),
            Some((scheme, _)) => {
                return Err(SourceError::UnsupportedScheme(scheme.to_string()));
            }
        };

        let files = if path.is_dir() {
            let mut files: Vec<PathBuf> = std::fs::read_dir(path)
                .map_err(|e| SourceError::Open {
                    uri: uri.to_string(),
                    reason: e.to_string(),
                })?
                .flatten()
                .map(|entry| entry.path())
                .filter(|p| {
                    p.extension()
                        .and_then(|e| e.to_str())
                        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                        .unwrap_or(false)
                })
                .collect();
            files.sort();
            files
        } else if path.is_file() {
            vec![path.to_path_buf()]
        } else {
            return Err(SourceError::Open {
                uri: uri.to_string(),
                reason: "no such file or directory".to_string(),
            });
        };

        if files.is_empty() {
            return Err(SourceError::Open {
                uri: uri.to_string(),
                reason: "directory contains no image files".to_string(),
            });
        }
        Ok(Box::new(ImageDirStream { files, next: 0 }))
    }
}

struct ImageDirStream {
    files: Vec<PathBuf>,
    next: usize,
}

impl VideoStream for ImageDirStream {
    fn fps(&self) -> Option<f64> {
        // Still images carry no native rate; the reader falls back.
        None
    }

    fn read(&mut self) -> Result<Frame, SourceError> {
        let path = &self.files[self.next];
        self.next = (self.next + 1) % self.files.len();
        invigil_imops::open_image(path).map_err(|e| SourceError::Read(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_jpg(path: &Path, w: usize, h: usize) {
        let frame = Frame::black(w, h);
        let jpeg = invigil_imops::encode_jpeg(&frame, 90).unwrap();
        std::fs::write(path, jpeg).unwrap();
    }

    #[test]
    fn loops_over_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_jpg(&dir.path().join("a.jpg"), 8, 6);
        write_jpg(&dir.path().join("b.jpg"), 8, 6);
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let backend = ImageDirBackend;
        let mut stream = backend.open(dir.path().to_str().unwrap()).unwrap();
        for _ in 0..5 {
            let frame = stream.read().unwrap();
            assert_eq!((frame.width, frame.height), (8, 6));
        }
    }

    #[test]
    fn accepts_file_scheme_and_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("only.jpg");
        write_jpg(&file, 4, 4);
        let uri = format!("file://{}", file.display());
        let mut stream = ImageDirBackend.open(&uri).unwrap();
        assert!(stream.read().is_ok());
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(matches!(
            ImageDirBackend.open("rtsp://camera/1"),
            Err(SourceError::UnsupportedScheme(s)) if s == "rtsp"
        ));
    }

    #[test]
    fn rejects_missing_and_empty_paths() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ImageDirBackend.open(dir.path().join("nope").to_str().unwrap()),
            Err(SourceError::Open { .. })
        ));
        assert!(matches!(
            ImageDirBackend.open(dir.path().to_str().unwrap()),
            Err(SourceError::Open { .. })
        ));
    }
}
