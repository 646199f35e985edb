//! Data loading, preprocessing and patch tiling

mod dataset;
mod loader;
mod patches;
mod preprocess;

pub use dataset::{
    list_image_files, list_subdirs, load_grayscale, load_sdoct_dataset, normalize_image,
    split_dataset, synthetic_pairs, synthetic_phantom, ImagePair, PairedDataset, SdoctSample,
};
pub use loader::{Batch, DataLoader};
pub use patches::{
    concat_batches, extract_patches, patch_chunks, reconstruct_from_patches, PatchConfig,
    PatchLocation,
};
pub use preprocess::{
    binarize, build_target, neighbour_average, paired_preprocessing, pairs_from_sequence,
    percentile, remove_small_components, PreprocessConfig,
};
