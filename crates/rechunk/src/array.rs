//! Zarr array access for the rechunker: opening arrays, creating the staging
//! and target arrays, and copying one block between them.

use std::sync::Arc;

use zarrs::array::codec::bytes_to_bytes::blosc::{
    BloscCodec, BloscCompressionLevel, BloscCompressor, BloscShuffleMode,
};
use zarrs::array::codec::BytesToBytesCodecTraits;
use zarrs::array::{Array, ArrayBuilder, ChunkGrid, DataType, FillValue};
use zarrs::storage::ReadableWritableListableStorageTraits;

use storage::ZarrStore;

use crate::config::{RechunkConfig, ZarrCompression};
use crate::error::{RechunkError, Result};
use crate::plan::ArraySpec;
use crate::types::{ArrayDescriptor, Block};

/// A Zarr array opened on a shared store handle.
pub type ZarrArray = Array<dyn ReadableWritableListableStorageTraits>;

/// Attribute set to `false` when a target is created and to `true` once every
/// block has been written.
pub const COMPLETE_ATTRIBUTE: &str = "rechunk_complete";

/// Bytes per element of the arrays the rechunker handles (float32).
pub const ITEM_SIZE: u64 = 4;

/// Open an existing array.
pub fn open_array(store: &ZarrStore, path: &str) -> Result<ZarrArray> {
    Array::open(store.clone(), path)
        .map_err(|e| RechunkError::zarr(format!("failed to open array at {}: {}", path, e)))
}

/// Describe an opened array: shape, chunk shape and element size.
///
/// Only float32 arrays are accepted.
pub fn descriptor_from_array(array: &ZarrArray) -> Result<ArrayDescriptor> {
    if *array.data_type() != DataType::Float32 {
        return Err(RechunkError::precondition(format!(
            "unsupported data type {:?}; expected float32",
            array.data_type()
        )));
    }

    let shape = array.shape().to_vec();
    let origin = vec![0u64; shape.len()];
    let chunks = array
        .chunk_grid()
        .chunk_shape(&origin, array.shape())
        .map_err(RechunkError::zarr)?
        .ok_or_else(|| RechunkError::zarr("array has no regular chunk grid"))?;
    let chunks: Vec<u64> = chunks.iter().map(|c| c.get()).collect();

    ArrayDescriptor::new(shape, chunks, ITEM_SIZE)
}

/// Open an array and describe it in one step.
pub fn describe(store: &ZarrStore, path: &str) -> Result<ArrayDescriptor> {
    descriptor_from_array(&open_array(store, path)?)
}

/// Create (or overwrite the metadata of) an array for `spec` and store its
/// metadata.
pub fn create_array(
    store: &ZarrStore,
    spec: &ArraySpec,
    config: &RechunkConfig,
    attributes: serde_json::Map<String, serde_json::Value>,
) -> Result<ZarrArray> {
    let chunk_grid: ChunkGrid = spec
        .chunks
        .clamped(&spec.shape)
        .0
        .try_into()
        .map_err(|e| RechunkError::config(format!("invalid chunk shape {}: {:?}", spec.chunks, e)))?;

    let mut builder = ArrayBuilder::new(
        spec.shape.clone(),
        DataType::Float32,
        chunk_grid,
        FillValue::from(f32::NAN),
    );
    builder.attributes(attributes);

    if config.compression != ZarrCompression::None {
        builder.bytes_to_bytes_codecs(vec![compression_codec(config)?]);
    }

    let array = builder
        .build(store.clone(), &spec.path)
        .map_err(|e| RechunkError::zarr(format!("failed to create {}: {}", spec.path, e)))?;
    array.store_metadata().map_err(RechunkError::zarr)?;
    Ok(array)
}

/// Blosc codec matching the configured compression.
fn compression_codec(config: &RechunkConfig) -> Result<Arc<dyn BytesToBytesCodecTraits>> {
    let level = BloscCompressionLevel::try_from(config.compression_level)
        .map_err(|_| RechunkError::config("invalid compression level"))?;

    let shuffle = if config.shuffle {
        BloscShuffleMode::Shuffle
    } else {
        BloscShuffleMode::NoShuffle
    };
    // Shuffling needs the element size
    let typesize = config.shuffle.then_some(ITEM_SIZE as usize);

    let compressor = match config.compression {
        ZarrCompression::BloscLz4 => BloscCompressor::LZ4,
        ZarrCompression::BloscZstd | ZarrCompression::None => BloscCompressor::Zstd,
    };

    let codec = BloscCodec::new(compressor, level, None, shuffle, typesize)
        .map_err(|e| RechunkError::config(e.to_string()))?;
    Ok(Arc::new(codec))
}

/// Copy one block from `from` to `to`. Returns the number of bytes moved.
pub fn copy_block(from: &ZarrArray, to: &ZarrArray, block: &Block) -> Result<u64> {
    let subset = block.to_subset()?;
    let data: Vec<f32> = from
        .retrieve_array_subset_elements(&subset)
        .map_err(RechunkError::zarr)?;
    to.store_array_subset_elements(&subset, &data)
        .map_err(RechunkError::zarr)?;
    Ok(data.len() as u64 * ITEM_SIZE)
}

/// Read the completion attribute of a target array.
pub fn is_marked_complete(array: &ZarrArray) -> bool {
    array
        .attributes()
        .get(COMPLETE_ATTRIBUTE)
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

/// Set the completion attribute and persist the metadata.
pub fn mark_complete(array: &mut ZarrArray) -> Result<()> {
    array
        .attributes_mut()
        .insert(COMPLETE_ATTRIBUTE.to_string(), serde_json::Value::Bool(true));
    array.store_metadata().map_err(RechunkError::zarr)
}
