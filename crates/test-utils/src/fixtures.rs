//! Zarr fixtures for tests that need a source array on disk.

use std::sync::Arc;

use zarrs::array::{Array, ArrayBuilder, DataType, FillValue};
use zarrs::array_subset::ArraySubset;
use zarrs::storage::ReadableWritableStorageTraits;

use crate::generators::Cube;

/// Error type for fixture helpers.
pub type FixtureError = Box<dyn std::error::Error + Send + Sync>;

/// Write `cube` as a float32 array at `path` with the given chunk shape.
///
/// Attributes, if any, are stored with the array metadata.
pub fn write_cube<TStorage>(
    store: Arc<TStorage>,
    path: &str,
    cube: &Cube,
    chunks: &[u64],
    attributes: Option<serde_json::Map<String, serde_json::Value>>,
) -> Result<Array<TStorage>, FixtureError>
where
    TStorage: ?Sized + ReadableWritableStorageTraits + 'static,
{
    let mut builder = ArrayBuilder::new(
        cube.shape(),
        DataType::Float32,
        chunks
            .to_vec()
            .try_into()
            .map_err(|e| format!("invalid chunk shape {:?}: {:?}", chunks, e))?,
        FillValue::from(f32::NAN),
    );
    if let Some(attributes) = attributes {
        builder.attributes(attributes);
    }

    let array = builder.build(store, path)?;
    array.store_metadata()?;

    let subset = ArraySubset::new_with_shape(cube.shape());
    array.store_array_subset_elements(&subset, &cube.data)?;
    Ok(array)
}

/// Read a whole float32 array back into memory.
pub fn read_all<TStorage>(array: &Array<TStorage>) -> Result<Vec<f32>, FixtureError>
where
    TStorage: ?Sized + ReadableWritableStorageTraits + 'static,
{
    let subset = ArraySubset::new_with_shape(array.shape().to_vec());
    Ok(array.retrieve_array_subset_elements(&subset)?)
}

/// Dataset catalog JSON pointing at a filesystem store.
pub fn catalog_json(root: &std::path::Path, dataset: &str, group: &str, variable: &str) -> String {
    let entry = serde_json::json!({
        "store": { "type": "filesystem", "root": root },
        "path": group,
        "variables": [variable],
        "time_step_days": 1.0
    });
    let mut datasets = serde_json::Map::new();
    datasets.insert(dataset.to_string(), entry);
    serde_json::json!({ "description": "test catalog", "datasets": datasets }).to_string()
}
