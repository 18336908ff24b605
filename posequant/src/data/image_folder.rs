use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::imageops::FilterType;
use tracing::{debug, info, warn};

use super::{BatchReader, CalibrationSource, IndexedReader};
use crate::{
    error::{PipelineError, PipelineResult, Stage},
    tensor::Tensor,
};

/// File extensions picked up when scanning a calibration directory, compared case-insensitively.
pub const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// Directory of images, decoded lazily and resized to the graph input.
#[derive(Clone, Debug)]
pub struct ImageFolder {
    root: PathBuf,
    files: Vec<PathBuf>,
    channels: usize,
    height: usize,
    width: usize,
}

impl ImageFolder {
    /// Scan `path` recursively. `target_shape` is the `[1, C, H, W]` layout of every sample.
    pub fn open<P: AsRef<Path>>(path: P, target_shape: &[usize]) -> PipelineResult<Self> {
        let root = path.as_ref().to_path_buf();
        let [1, channels, height, width] = *target_shape else {
            return Err(PipelineError::invalid_config(
                Stage::Data,
                "input_shape",
                format!("expected [1, C, H, W], got {target_shape:?}"),
            ));
        };
        if !(channels == 1 || channels == 3) || height == 0 || width == 0 {
            return Err(PipelineError::invalid_config(
                Stage::Data,
                "input_shape",
                format!("unsupported image layout {target_shape:?}, C must be 1 or 3"),
            ));
        }
        if !root.is_dir() {
            return Err(PipelineError::InputNotFound {
                stage: Stage::Data,
                path: root,
            });
        }
        let mut files = vec![];
        if let Err(e) = collect_images(&root, &mut files) {
            warn!("cannot scan {}: {e}", root.display());
            return Err(PipelineError::InputNotFound {
                stage: Stage::Data,
                path: root,
            });
        }
        files.sort();
        if files.is_empty() {
            return Err(PipelineError::EmptyCalibrationSet {
                stage: Stage::Data,
                source_name: root.display().to_string(),
            });
        }
        info!("found {} calibration images under {}", files.len(), root.display());
        Ok(Self {
            root,
            files,
            channels,
            height,
            width,
        })
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    fn decode(&self, path: &Path) -> Result<Tensor<f32>> {
        let img = image::open(path).with_context(|| format!("decoding {}", path.display()))?;
        let (w, h) = (self.width as u32, self.height as u32);
        let raw = if self.channels == 3 {
            image::imageops::resize(&img.to_rgb8(), w, h, FilterType::Triangle).into_raw()
        } else {
            image::imageops::resize(&img.to_luma8(), w, h, FilterType::Triangle).into_raw()
        };
        // HWC bytes to CHW floats.
        let plane = self.height * self.width;
        let mut data = vec![0f32; self.channels * plane];
        for (i, px) in raw.iter().enumerate() {
            let (pos, c) = (i / self.channels, i % self.channels);
            data[c * plane + pos] = *px as f32 / 255.0;
        }
        Ok(Tensor::new(vec![1, self.channels, self.height, self.width], data))
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.iter().any(|x| x.eq_ignore_ascii_case(e)))
}

fn collect_images(dir: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_images(&path, files)?;
        } else if is_image(&path) {
            files.push(path);
        }
    }
    Ok(())
}

impl CalibrationSource for ImageFolder {
    fn name(&self) -> String {
        self.root.display().to_string()
    }

    fn open(&self) -> PipelineResult<Box<dyn BatchReader + '_>> {
        Ok(Box::new(IndexedReader::new(self.files.len(), move |i| {
            let path = &self.files[i];
            match self.decode(path) {
                Ok(t) => {
                    debug!("loaded {}", path.display());
                    Some(t)
                }
                Err(e) => {
                    warn!("skipping calibration image: {e:#}");
                    None
                }
            }
        })))
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;

    fn corpus() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        RgbImage::from_pixel(8, 6, Rgb([255, 0, 0])).save(dir.path().join("a.png")).unwrap();
        RgbImage::from_pixel(4, 4, Rgb([0, 0, 255])).save(nested.join("b.PNG")).unwrap();
        std::fs::write(dir.path().join("broken.jpg"), b"not a jpeg").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        dir
    }

    #[test]
    fn test_scans_recursively_and_sorts() {
        let dir = corpus();
        let folder = ImageFolder::open(dir.path(), &[1, 3, 4, 4]).unwrap();
        let names: Vec<_> = folder
            .files()
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.png", "broken.jpg", "nested/b.PNG"]);
    }

    #[test]
    fn test_decodes_chw_and_skips_broken_files() {
        let dir = corpus();
        let folder = ImageFolder::open(dir.path(), &[1, 3, 4, 4]).unwrap();
        let mut reader = folder.open().unwrap();
        let batch = reader.next_batch(8).unwrap();
        assert_eq!(batch.len(), 2);
        let red = &batch[0];
        assert_eq!(red.get_shape(), vec![1, 3, 4, 4]);
        assert!(red.get_data()[..16].iter().all(|v| (*v - 1.0).abs() < 1e-6));
        assert!(red.get_data()[16..].iter().all(|v| *v == 0.0));
        assert!(reader.next_batch(8).is_none());
    }

    #[test]
    fn test_grayscale_layout() {
        let dir = corpus();
        let folder = ImageFolder::open(dir.path(), &[1, 1, 2, 2]).unwrap();
        let batch = folder.open().unwrap().next_batch(1).unwrap();
        assert_eq!(batch[0].get_shape(), vec![1, 1, 2, 2]);
    }

    #[test]
    fn test_error_cases() {
        let missing = ImageFolder::open("/definitely/not/here", &[1, 3, 4, 4]).unwrap_err();
        assert!(matches!(missing, PipelineError::InputNotFound { .. }));

        let empty = tempfile::tempdir().unwrap();
        std::fs::write(empty.path().join("readme.md"), b"#").unwrap();
        let err = ImageFolder::open(empty.path(), &[1, 3, 4, 4]).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyCalibrationSet { .. }));

        let err = ImageFolder::open(empty.path(), &[2, 3, 4, 4]).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig { .. }));
    }
}
