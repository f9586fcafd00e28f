use std::fs::File;
use std::io::{BufReader, ErrorKind};
use std::path::{Path, PathBuf};

use crate::error::DatasetLoadError;
use crate::pickle::{read_pickle, Object};

pub const WIDTH: usize = 32;
pub const HEIGHT: usize = 32;
pub const CHANNELS: usize = 3;
pub const IMAGE_SIZE: usize = CHANNELS * HEIGHT * WIDTH;

pub const NUM_CLASSES: usize = 10;

/// Category names indexed by the model output position.
pub const CLASSES: [&str; NUM_CLASSES] = [
    "airplane",
    "automobile",
    "bird",
    "cat",
    "deer",
    "dog",
    "frog",
    "horse",
    "ship",
    "truck",
];

/// Pickled shards of the CIFAR-10 Python release.
pub const TRAIN_SHARDS: [&str; 5] = [
    "data_batch_1",
    "data_batch_2",
    "data_batch_3",
    "data_batch_4",
    "data_batch_5",
];
pub const TEST_SHARD: &str = "test_batch";

/// Raw images (channel-first `u8` planes, [`IMAGE_SIZE`] bytes each) and their labels.
///
/// A partition is never mutated once built; samplers share it through an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cifar10Partition {
    images: Vec<u8>,
    labels: Vec<u8>,
}

impl Cifar10Partition {
    /// Builds a partition from flat pixel storage and a parallel label list.
    pub fn from_records(images: Vec<u8>, labels: Vec<u8>) -> Result<Self, DatasetLoadError> {
        if images.len() % IMAGE_SIZE != 0 || images.len() / IMAGE_SIZE != labels.len() {
            return Err(DatasetLoadError::CountMismatch {
                images: images.len() / IMAGE_SIZE,
                labels: labels.len(),
            });
        }
        if let Some(index) = labels
            .iter()
            .position(|&label| label as usize >= NUM_CLASSES)
        {
            return Err(DatasetLoadError::InvalidLabel {
                index,
                label: labels[index],
            });
        }

        Ok(Self { images, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Raw pixels of the image at `index`.
    pub fn image(&self, index: usize) -> Option<&[u8]> {
        let start = index.checked_mul(IMAGE_SIZE)?;
        self.images.get(start..start + IMAGE_SIZE)
    }

    pub fn label(&self, index: usize) -> Option<u8> {
        self.labels.get(index).copied()
    }

    pub fn labels(&self) -> &[u8] {
        &self.labels
    }

    /// Number of samples per class.
    pub fn class_histogram(&self) -> [usize; NUM_CLASSES] {
        let mut histogram = [0; NUM_CLASSES];
        for &label in &self.labels {
            histogram[label as usize] += 1;
        }
        histogram
    }

    fn extend(&mut self, other: Cifar10Partition) {
        self.images.extend(other.images);
        self.labels.extend(other.labels);
    }
}

/// Loads the train partition (shards 1 to 5, in that order) and the test partition.
pub fn load_cifar10<P: AsRef<Path>>(
    data_dir: P,
) -> Result<(Cifar10Partition, Cifar10Partition), DatasetLoadError> {
    let root = data_dir.as_ref();

    let mut train = Cifar10Partition {
        images: Vec::new(),
        labels: Vec::new(),
    };
    for shard in TRAIN_SHARDS {
        train.extend(read_shard(root.join(shard))?);
    }
    let test = read_shard(root.join(TEST_SHARD))?;

    log::info!(
        "Loaded CIFAR-10 from {}: {} train samples, {} test samples",
        root.display(),
        train.len(),
        test.len()
    );

    Ok((train, test))
}

/// Reads a single pickled shard: a mapping with a `data` array of shape `(N, 3072)` and a
/// `labels` list of `N` integers.
pub fn read_shard(path: PathBuf) -> Result<Cifar10Partition, DatasetLoadError> {
    let file = File::open(&path).map_err(|source| match source.kind() {
        ErrorKind::NotFound => DatasetLoadError::MissingShard { path: path.clone() },
        _ => DatasetLoadError::Io {
            path: path.clone(),
            source,
        },
    })?;

    let object = read_pickle(&mut BufReader::new(file)).map_err(|source| {
        DatasetLoadError::Pickle {
            path: path.clone(),
            source,
        }
    })?;

    let partition = shard_from_object(&object)
        .map_err(|reason| DatasetLoadError::Malformed { path: path.clone(), reason })?;
    log::debug!("Read {} records from {}", partition.len(), path.display());

    Ok(partition)
}

fn shard_from_object(object: &Object) -> Result<Cifar10Partition, String> {
    if !matches!(object, Object::Dict(_)) {
        return Err("top-level object is not a dict".to_string());
    }
    let data = object.get("data").ok_or("missing 'data' entry")?;
    let labels = object.get("labels").ok_or("missing 'labels' entry")?;

    let images = pixel_bytes(data)?;
    let labels = label_bytes(labels)?;

    if images.len() % IMAGE_SIZE != 0 {
        return Err(format!(
            "{} pixel bytes do not split into {IMAGE_SIZE}-byte images",
            images.len()
        ));
    }
    let num_images = images.len() / IMAGE_SIZE;
    if num_images != labels.len() {
        return Err(format!(
            "{num_images} images but {} labels",
            labels.len()
        ));
    }
    if labels.is_empty() {
        return Err("shard holds no records".to_string());
    }

    Ok(Cifar10Partition { images, labels })
}

/// Flattens the `data` entry into row-major `u8` pixels.
fn pixel_bytes(data: &Object) -> Result<Vec<u8>, String> {
    match data {
        Object::Bytes(bytes) => Ok(bytes.clone()),
        Object::List(rows) => {
            let mut pixels = Vec::with_capacity(rows.len() * IMAGE_SIZE);
            for (index, row) in rows.iter().enumerate() {
                let row = match row {
                    Object::List(values) => int_bytes(values)
                        .map_err(|reason| format!("image {index}: {reason}"))?,
                    other => raw_bytes(other)
                        .ok_or_else(|| format!("image {index} is neither bytes nor a list"))?,
                };
                if row.len() != IMAGE_SIZE {
                    return Err(format!(
                        "image {index} has {} values, expected {IMAGE_SIZE}",
                        row.len()
                    ));
                }
                pixels.extend(row);
            }
            Ok(pixels)
        }
        Object::Build { callable, args } if callable.is_reduce_of("_reconstruct") => {
            ndarray_state(args)
        }
        Object::Reduce { callable, args } if callable.is_class("_frombuffer") => {
            ndarray_from_buffer(args)
        }
        _ => Err("'data' is not an array of bytes".to_string()),
    }
}

/// `ndarray.__setstate__` arguments: `(version, shape, dtype, is_fortran, raw)`.
fn ndarray_state(state: &Object) -> Result<Vec<u8>, String> {
    let Object::Tuple(items) = state else {
        return Err("array state is not a tuple".to_string());
    };
    let (shape, dtype, fortran, raw) = match items.as_slice() {
        [_version, shape, dtype, fortran, raw] => (shape, dtype, fortran, raw),
        [shape, dtype, fortran, raw] => (shape, dtype, fortran, raw),
        _ => return Err(format!("array state has {} fields", items.len())),
    };

    check_dtype(dtype)?;
    if fortran.as_int() == Some(1) {
        return Err("Fortran-ordered arrays are not supported".to_string());
    }
    let raw = raw_bytes(raw).ok_or("array payload is not a byte string")?;
    check_shape(shape, raw.len())?;

    Ok(raw)
}

/// `numpy.core.numeric._frombuffer(buffer, dtype, shape, order)`, written by protocol 5.
fn ndarray_from_buffer(args: &Object) -> Result<Vec<u8>, String> {
    let Object::Tuple(items) = args else {
        return Err("_frombuffer arguments are not a tuple".to_string());
    };
    let [buffer, dtype, shape, order] = items.as_slice() else {
        return Err(format!("_frombuffer takes 4 arguments, got {}", items.len()));
    };

    check_dtype(dtype)?;
    if order.as_text().as_deref() != Some("C") {
        return Err("only C-ordered arrays are supported".to_string());
    }
    let raw = raw_bytes(buffer).ok_or("array payload is not a byte string")?;
    check_shape(shape, raw.len())?;

    Ok(raw)
}

fn check_dtype(dtype: &Object) -> Result<(), String> {
    let reduce = match dtype {
        Object::Build { callable, .. } => callable.as_ref(),
        other => other,
    };
    let code = match reduce {
        Object::Reduce { callable, args } if callable.is_class("dtype") => match args.as_ref() {
            Object::Tuple(items) => items.first().and_then(Object::as_text),
            _ => None,
        },
        _ => None,
    };

    match code.as_deref().map(|code| code.trim_start_matches(['|', '<', '>', '='])) {
        Some("u1") => Ok(()),
        Some(code) => Err(format!("unsupported array dtype '{code}', expected u1")),
        None => Err("array dtype is not a numpy dtype".to_string()),
    }
}

fn check_shape(shape: &Object, num_bytes: usize) -> Result<(), String> {
    let Object::Tuple(dims) = shape else {
        return Err("array shape is not a tuple".to_string());
    };
    let dims = dims
        .iter()
        .map(|dim| {
            dim.as_int()
                .and_then(|dim| usize::try_from(dim).ok())
                .ok_or_else(|| format!("invalid array dimension {dim:?}"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let expected = dims.iter().product::<usize>();
    if expected != num_bytes {
        return Err(format!(
            "array of shape {dims:?} holds {num_bytes} bytes, expected {expected}"
        ));
    }
    Ok(())
}

/// Byte payload of a pickled string.
///
/// Python 3 writes `bytes` under protocol 2 as `_codecs.encode(text, 'latin1')`.
fn raw_bytes(object: &Object) -> Option<Vec<u8>> {
    match object {
        Object::Bytes(bytes) => Some(bytes.clone()),
        Object::Reduce { callable, args } if callable.is_class("encode") => {
            let Object::Tuple(items) = args.as_ref() else {
                return None;
            };
            match items.as_slice() {
                [Object::String(text), encoding]
                    if encoding.as_text().as_deref() == Some("latin1") =>
                {
                    text.chars().map(|c| u8::try_from(c).ok()).collect()
                }
                [Object::String(text)] => text.chars().map(|c| u8::try_from(c).ok()).collect(),
                _ => None,
            }
        }
        _ => None,
    }
}

fn int_bytes(values: &[Object]) -> Result<Vec<u8>, String> {
    values
        .iter()
        .enumerate()
        .map(|(index, value)| {
            value
                .as_int()
                .and_then(|value| u8::try_from(value).ok())
                .ok_or_else(|| format!("value {index} is not a byte: {value:?}"))
        })
        .collect()
}

fn label_bytes(labels: &Object) -> Result<Vec<u8>, String> {
    let values = match labels {
        Object::List(values) | Object::Tuple(values) => values,
        _ => return Err("'labels' is not a list".to_string()),
    };

    values
        .iter()
        .enumerate()
        .map(|(index, value)| match value.as_int() {
            Some(label) if (0..NUM_CLASSES as i64).contains(&label) => Ok(label as u8),
            Some(label) => Err(format!("record {index} has label {label}, expected 0..=9")),
            None => Err(format!("record {index} has a non-integer label {value:?}")),
        })
        .collect()
}
