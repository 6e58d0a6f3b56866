//! Thin helpers over `hdf5` used by session persistence.
//!
//! Scalars are stored as attributes, arrays as datasets. Booleans are
//! stored as `u8` and strings as variable-length UTF-8. Readers come in a
//! required and an `_opt` flavour; the latter return `Ok(None)` when the
//! object is absent.

use std::path::Path;
use std::str::FromStr;

use hdf5::types::{H5Type, VarLenUnicode};
use hdf5::{Dataset, File, Group};
use log::debug;
use ndarray::{Array2, ArrayView1, ArrayView2};

use crate::{Error, Result};

const CHUNK_EDGE: usize = 256;
const DEFLATE_LEVEL: u8 = 4;

/// Create (truncate) an HDF5 file.
///
/// # Errors
/// Returns an error if the file cannot be created.
pub fn create_file<P: AsRef<Path>>(path: P) -> Result<File> {
    Ok(File::create(path)?)
}

/// Open an HDF5 file read-only.
///
/// # Errors
/// Returns an error if the file cannot be opened.
pub fn open_file<P: AsRef<Path>>(path: P) -> Result<File> {
    Ok(File::open(path)?)
}

/// Child group `name`, created when missing.
///
/// # Errors
/// Returns an error if the group cannot be opened or created.
pub fn ensure_group(parent: &Group, name: &str) -> Result<Group> {
    if parent.link_exists(name) {
        Ok(parent.group(name)?)
    } else {
        Ok(parent.create_group(name)?)
    }
}

/// Child group `name`, if it exists.
///
/// # Errors
/// Returns an error if the link exists but is not a readable group.
pub fn group_opt(parent: &Group, name: &str) -> Result<Option<Group>> {
    if parent.link_exists(name) {
        Ok(Some(parent.group(name)?))
    } else {
        Ok(None)
    }
}

/// Children of `parent` named by a decimal index, in index order.
///
/// # Errors
/// Returns an error if the members cannot be listed.
pub fn indexed_groups(parent: &Group) -> Result<Vec<Group>> {
    let mut indexed: Vec<(usize, String)> = parent
        .member_names()?
        .into_iter()
        .filter_map(|name| name.parse::<usize>().ok().map(|i| (i, name)))
        .collect();
    indexed.sort_unstable();
    indexed
        .into_iter()
        .map(|(_, name)| Ok(parent.group(&name)?))
        .collect()
}

/// Names of all members of `group`, sorted.
///
/// # Errors
/// Returns an error if the members cannot be listed.
pub fn member_names(group: &Group) -> Result<Vec<String>> {
    let mut names = group.member_names()?;
    names.sort();
    Ok(names)
}

fn to_var_len_unicode(value: &str) -> Result<VarLenUnicode> {
    VarLenUnicode::from_str(value)
        .map_err(|e| Error::InvalidFormat(format!("invalid utf-8 attribute: {e}")))
}

/// Write a scalar attribute.
///
/// # Errors
/// Returns an error if the attribute cannot be created.
pub fn set_attr<T: H5Type>(group: &Group, name: &str, value: &T) -> Result<()> {
    group.new_attr::<T>().create(name)?.write_scalar(value)?;
    Ok(())
}

/// Write a string attribute.
///
/// # Errors
/// Returns an error if the attribute cannot be created.
pub fn set_attr_str(group: &Group, name: &str, value: &str) -> Result<()> {
    let value = to_var_len_unicode(value)?;
    group
        .new_attr::<VarLenUnicode>()
        .create(name)?
        .write_scalar(&value)?;
    Ok(())
}

/// Write a boolean attribute (stored as `u8`).
///
/// # Errors
/// Returns an error if the attribute cannot be created.
pub fn set_attr_bool(group: &Group, name: &str, value: bool) -> Result<()> {
    set_attr(group, name, &u8::from(value))
}

/// Read a scalar attribute if present.
///
/// # Errors
/// Returns an error if the attribute exists but has another type.
pub fn read_attr_opt<T: H5Type + Clone>(group: &Group, name: &str) -> Result<Option<T>> {
    match group.attr(name) {
        Ok(attr) => Ok(Some(attr.read_scalar::<T>()?)),
        Err(_) => Ok(None),
    }
}

/// Read a required scalar attribute.
///
/// # Errors
/// Returns `InvalidFormat` when the attribute is missing.
pub fn read_attr<T: H5Type + Clone>(group: &Group, name: &str) -> Result<T> {
    read_attr_opt(group, name)?.ok_or_else(|| missing(group, name))
}

/// Read a string attribute if present.
///
/// # Errors
/// Returns an error if the attribute exists but is not a string.
pub fn read_attr_opt_string(group: &Group, name: &str) -> Result<Option<String>> {
    match group.attr(name) {
        Ok(attr) => {
            let value: VarLenUnicode = attr.read_scalar()?;
            Ok(Some(value.to_string()))
        }
        Err(_) => Ok(None),
    }
}

/// Read a required string attribute.
///
/// # Errors
/// Returns `InvalidFormat` when the attribute is missing.
pub fn read_attr_string(group: &Group, name: &str) -> Result<String> {
    read_attr_opt_string(group, name)?.ok_or_else(|| missing(group, name))
}

/// Read a boolean attribute if present.
///
/// # Errors
/// Returns an error if the attribute exists but is not a `u8`.
pub fn read_attr_opt_bool(group: &Group, name: &str) -> Result<Option<bool>> {
    Ok(read_attr_opt::<u8>(group, name)?.map(|v| v != 0))
}

/// Names of all attributes on `group`, sorted.
///
/// # Errors
/// Returns an error if the attributes cannot be listed.
pub fn attr_names(group: &Group) -> Result<Vec<String>> {
    let mut names = group.attr_names()?;
    names.sort();
    Ok(names)
}

fn missing(group: &Group, name: &str) -> Error {
    Error::InvalidFormat(format!("{} has no '{name}'", group.name()))
}

fn create_fixed_dataset<T: H5Type, S>(
    group: &Group,
    name: &str,
    shape: S,
    chunk: Option<(usize, usize)>,
    compression: Option<u8>,
) -> Result<Dataset>
where
    S: Into<hdf5::Extents>,
{
    let mut builder = group.new_dataset::<T>().shape(shape);

    if let Some(chunk_shape) = chunk {
        builder = builder.chunk(chunk_shape);
    }

    if let Some(level) = compression {
        builder = builder.deflate(level).shuffle();
    }

    Ok(builder.create(name)?)
}

/// Write a 1D `f64` dataset.
///
/// # Errors
/// Returns an error if the dataset cannot be created or written.
pub fn write_vec(group: &Group, name: &str, values: &[f64]) -> Result<()> {
    let dataset = create_fixed_dataset::<f64, _>(group, name, (values.len(),), None, None)?;
    if !values.is_empty() {
        dataset.write(ArrayView1::from(values))?;
    }
    Ok(())
}

/// Read a 1D `f64` dataset.
///
/// # Errors
/// Returns an error if the dataset is missing or unreadable.
pub fn read_vec(group: &Group, name: &str) -> Result<Vec<f64>> {
    Ok(group.dataset(name)?.read_raw::<f64>()?)
}

/// Read a 1D `f64` dataset if present.
///
/// # Errors
/// Returns an error if the dataset exists but is unreadable.
pub fn read_vec_opt(group: &Group, name: &str) -> Result<Option<Vec<f64>>> {
    if group.link_exists(name) {
        read_vec(group, name).map(Some)
    } else {
        Ok(None)
    }
}

fn write_2d<T: H5Type + Clone>(group: &Group, name: &str, data: ArrayView2<'_, T>) -> Result<()> {
    let (rows, cols) = data.dim();
    let dataset = if rows == 0 || cols == 0 {
        create_fixed_dataset::<T, _>(group, name, (rows, cols), None, None)?
    } else {
        create_fixed_dataset::<T, _>(
            group,
            name,
            (rows, cols),
            Some((rows.min(CHUNK_EDGE), cols.min(CHUNK_EDGE))),
            Some(DEFLATE_LEVEL),
        )?
    };
    if !data.is_empty() {
        let data = data.as_standard_layout();
        dataset.write(data.view())?;
    }
    debug!("wrote {name} {rows}x{cols}");
    Ok(())
}

/// Write a compressed 2D `f64` dataset.
///
/// # Errors
/// Returns an error if the dataset cannot be created or written.
pub fn write_array2(group: &Group, name: &str, data: ArrayView2<'_, f64>) -> Result<()> {
    write_2d(group, name, data)
}

/// Read a 2D `f64` dataset.
///
/// # Errors
/// Returns an error if the dataset is missing or not two-dimensional.
pub fn read_array2(group: &Group, name: &str) -> Result<Array2<f64>> {
    Ok(group.dataset(name)?.read_2d::<f64>()?)
}

/// Read a 2D `f64` dataset if present.
///
/// # Errors
/// Returns an error if the dataset exists but is unreadable.
pub fn read_array2_opt(group: &Group, name: &str) -> Result<Option<Array2<f64>>> {
    if group.link_exists(name) {
        read_array2(group, name).map(Some)
    } else {
        Ok(None)
    }
}

/// Write a boolean mask as a `u8` dataset.
///
/// # Errors
/// Returns an error if the dataset cannot be created or written.
pub fn write_mask(group: &Group, name: &str, mask: ArrayView2<'_, bool>) -> Result<()> {
    write_2d(group, name, mask.mapv(u8::from).view())
}

/// Read a `u8` dataset as a boolean mask.
///
/// # Errors
/// Returns an error if the dataset is missing or not two-dimensional.
pub fn read_mask(group: &Group, name: &str) -> Result<Array2<bool>> {
    Ok(group.dataset(name)?.read_2d::<u8>()?.mapv(|v| v != 0))
}
