use std::path::{Path, PathBuf};

use indicatif::ProgressIterator;
use log::debug;
use rand::{seq::SliceRandom, Rng};
use thiserror::Error;

use crate::{
    imaging::{self, ImageError, Patch},
    noise::{self, NoiseLevel},
};

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("{0} does not exist")]
    MissingPath(PathBuf),
    #[error("failed to read manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error("patch size and stride must be positive, got size {size} and stride {stride}")]
    Geometry { size: usize, stride: usize },
}

/// Patches paired with the noise level each was corrupted at. Both vectors
/// always have the same length and matching order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabeledDataset {
    patches: Vec<Patch>,
    labels: Vec<NoiseLevel>,
}

impl LabeledDataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, patch: Patch, label: NoiseLevel) {
        self.patches.push(patch);
        self.labels.push(label);
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    pub fn labels(&self) -> &[NoiseLevel] {
        &self.labels
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Patch, NoiseLevel)> {
        self.patches.iter().zip(self.labels.iter().copied())
    }

    /// Applies one random permutation to patches and labels alike.
    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);

        let mut patches: Vec<Option<Patch>> = std::mem::take(&mut self.patches)
            .into_iter()
            .map(Some)
            .collect();

        self.patches = order.iter().filter_map(|&i| patches[i].take()).collect();
        self.labels = order.iter().map(|&i| self.labels[i]).collect();
    }
}

impl FromIterator<(Patch, NoiseLevel)> for LabeledDataset {
    fn from_iter<T: IntoIterator<Item = (Patch, NoiseLevel)>>(iter: T) -> Self {
        let (patches, labels) = iter.into_iter().unzip();
        Self { patches, labels }
    }
}

/// Image filenames listed one per line. Blank lines are ignored.
pub fn read_manifest(path: impl AsRef<Path>) -> Result<Vec<String>, DatasetError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(DatasetError::MissingPath(path.to_path_buf()));
    }

    let contents = std::fs::read_to_string(path).map_err(|source| DatasetError::Manifest {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Builds a labeled dataset from the images named in `manifest`.
///
/// Each image gets a single random noise level. The whole image is corrupted
/// first and then cut into `patch_size` windows placed every `patch_stride`
/// pixels, all labeled with that level. Any unreadable image aborts the build.
pub fn build<R: Rng + ?Sized>(
    source_directory: impl AsRef<Path>,
    manifest: impl AsRef<Path>,
    patch_size: usize,
    patch_stride: usize,
    rng: &mut R,
) -> Result<LabeledDataset, DatasetError> {
    let source_directory = source_directory.as_ref();

    if patch_size == 0 || patch_stride == 0 {
        return Err(DatasetError::Geometry {
            size: patch_size,
            stride: patch_stride,
        });
    }
    if !source_directory.is_dir() {
        return Err(DatasetError::MissingPath(source_directory.to_path_buf()));
    }

    let files = read_manifest(manifest)?;
    let style = indicatif::ProgressStyle::with_template(
        "[{elapsed:.green}] [{wide_bar:.cyan/red}] {pos:.red}/{len:.green} images ({eta})",
    )
    .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
    .progress_chars("=> ");

    let mut dataset = LabeledDataset::new();

    for file in files.iter().progress_with_style(style) {
        let clean = imaging::load_image(source_directory.join(file))?;
        let level = NoiseLevel::random(rng);
        let noised = noise::synthesize(&clean, level, rng);

        let patches = imaging::extract_patches(noised.view(), patch_size, patch_stride);
        debug!("{file}: {} patches at noise level {level}", patches.len());

        for patch in patches {
            dataset.push(patch, level);
        }
    }

    Ok(dataset)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use ndarray::Array3;
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn write_corpus(dir: &Path, names: &[&str], width: u32, height: u32) {
        for (i, name) in names.iter().enumerate() {
            let img = image::RgbImage::from_fn(width, height, |x, y| {
                let v = ((x * 3 + y * 5 + i as u32 * 17) % 256) as u8;
                image::Rgb([v, v / 2, 255 - v])
            });
            img.save(dir.join(name)).unwrap();
        }
    }

    #[test]
    fn builds_n_times_k_patches() {
        let dir = tempfile::tempdir().unwrap();
        let names = ["a.png", "b.png", "c.png"];
        write_corpus(dir.path(), &names, 64, 64);
        let manifest = dir.path().join("train.txt");
        fs::write(&manifest, names.join("\n")).unwrap();

        let mut rng = StdRng::seed_from_u64(9);
        let dataset = build(dir.path(), &manifest, 32, 32, &mut rng).unwrap();

        assert_eq!(dataset.len(), 3 * 4);
        assert_eq!(dataset.patches().len(), dataset.labels().len());
        assert!(dataset.patches().iter().all(|p| p.dim() == (32, 32, 3)));
        assert!(dataset.labels().iter().all(|l| l.value() <= NoiseLevel::MAX));
    }

    #[test]
    fn one_level_per_image() {
        let dir = tempfile::tempdir().unwrap();
        let names = ["a.png", "b.png"];
        write_corpus(dir.path(), &names, 48, 48);
        let manifest = dir.path().join("test.txt");
        fs::write(&manifest, "a.png\n\n  b.png  \n").unwrap();

        let mut rng = StdRng::seed_from_u64(2);
        let dataset = build(dir.path(), &manifest, 16, 16, &mut rng).unwrap();

        assert_eq!(dataset.len(), 2 * 9);
        for chunk in dataset.labels().chunks(9) {
            assert!(chunk.iter().all(|l| *l == chunk[0]));
        }
    }

    #[test]
    fn same_seed_same_dataset() {
        let dir = tempfile::tempdir().unwrap();
        write_corpus(dir.path(), &["a.png"], 40, 40);
        let manifest = dir.path().join("m.txt");
        fs::write(&manifest, "a.png").unwrap();

        let a = build(dir.path(), &manifest, 20, 10, &mut StdRng::seed_from_u64(4)).unwrap();
        let b = build(dir.path(), &manifest, 20, 10, &mut StdRng::seed_from_u64(4)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn missing_source_directory() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("m.txt");
        fs::write(&manifest, "a.png").unwrap();

        let err = build(dir.path().join("nope"), &manifest, 32, 32, &mut rand::rng()).unwrap_err();
        assert!(matches!(err, DatasetError::MissingPath(_)));
    }

    #[test]
    fn missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let err = build(dir.path(), dir.path().join("m.txt"), 32, 32, &mut rand::rng()).unwrap_err();
        assert!(matches!(err, DatasetError::MissingPath(_)));
    }

    #[test]
    fn unreadable_image_aborts() {
        let dir = tempfile::tempdir().unwrap();
        write_corpus(dir.path(), &["a.png"], 32, 32);
        fs::write(dir.path().join("broken.png"), b"not a png").unwrap();
        let manifest = dir.path().join("m.txt");
        fs::write(&manifest, "a.png\nbroken.png\n").unwrap();

        let err = build(dir.path(), &manifest, 16, 16, &mut rand::rng()).unwrap_err();
        assert!(matches!(err, DatasetError::Image(_)));
    }

    #[test]
    fn zero_stride_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = build(dir.path(), dir.path().join("m.txt"), 32, 0, &mut rand::rng()).unwrap_err();
        assert!(matches!(err, DatasetError::Geometry { .. }));
    }

    #[test]
    fn shuffle_keeps_pairs_aligned() {
        let mut dataset: LabeledDataset = (0..50u8)
            .map(|i| {
                let level = NoiseLevel::new(i % 10).unwrap();
                (Array3::from_elem((2, 2, 1), level.value() as f32), level)
            })
            .collect();

        dataset.shuffle(&mut StdRng::seed_from_u64(1));

        assert_eq!(dataset.len(), 50);
        for (patch, label) in dataset.iter() {
            assert_eq!(patch[[0, 0, 0]], label.value() as f32);
        }
    }
}
