//! Input Validation Utilities
//!
//! Shape and size checks run before any tensor work, so malformed inputs
//! fail fast with a precise error instead of a backend panic.

use crate::core::RecognitionError;

/// Validates that a value is positive (> 0).
#[inline]
pub fn validate_positive<T: PartialOrd + std::fmt::Display + Default>(
    value: T,
    param_name: &str,
) -> Result<(), RecognitionError> {
    if value <= T::default() {
        return Err(RecognitionError::InvalidConfiguration {
            message: format!(
                "Parameter '{}' must be positive, got: {}",
                param_name, value
            ),
        });
    }
    Ok(())
}

/// Validates that an embedding depth can be split in half.
#[inline]
pub fn validate_even(value: usize, param_name: &str) -> Result<(), RecognitionError> {
    if !value.is_multiple_of(2) {
        return Err(RecognitionError::InvalidConfiguration {
            message: format!("Embedding depth {} for '{}' is not even", value, param_name),
        });
    }
    Ok(())
}

/// Validates that a collection is not empty.
#[inline]
pub fn validate_non_empty<T>(items: &[T], param_name: &str) -> Result<(), RecognitionError> {
    if items.is_empty() {
        return Err(RecognitionError::InvalidInput {
            message: format!("Parameter '{}' cannot be empty", param_name),
        });
    }
    Ok(())
}

/// Validates that two collections have the same length.
#[inline]
pub fn validate_same_length<T, U>(
    items1: &[T],
    items2: &[U],
    name1: &str,
    name2: &str,
) -> Result<(), RecognitionError> {
    if items1.len() != items2.len() {
        return Err(RecognitionError::InvalidInput {
            message: format!(
                "Length mismatch: {} has {} elements, but {} has {} elements",
                name1,
                items1.len(),
                name2,
                items2.len()
            ),
        });
    }
    Ok(())
}

/// Validates tensor rank.
pub fn validate_tensor_shape(
    shape: &[usize],
    expected_dims: usize,
    tensor_name: &str,
) -> Result<(), RecognitionError> {
    if shape.len() != expected_dims {
        return Err(RecognitionError::InvalidInput {
            message: format!(
                "Tensor '{}' expected {}D shape, got {}D: {:?}",
                tensor_name,
                expected_dims,
                shape.len(),
                shape
            ),
        });
    }
    Ok(())
}

/// Validates that one axis of a tensor has the expected size.
///
/// Raises `DimensionMismatch`; nothing is truncated or padded.
pub fn validate_axis(
    shape: &[usize],
    axis: usize,
    expected: usize,
    component: &str,
) -> Result<(), RecognitionError> {
    let actual = shape.get(axis).copied().ok_or_else(|| {
        RecognitionError::invalid_input(format!(
            "{}: axis {} out of range for shape {:?}",
            component, axis, shape
        ))
    })?;
    if actual != expected {
        return Err(RecognitionError::dimension_mismatch(
            component, expected, actual,
        ));
    }
    Ok(())
}

/// Validates that one axis of a tensor does not exceed a precomputed capacity.
pub fn validate_axis_capacity(
    shape: &[usize],
    axis: usize,
    capacity: usize,
    component: &str,
) -> Result<(), RecognitionError> {
    let actual = shape.get(axis).copied().ok_or_else(|| {
        RecognitionError::invalid_input(format!(
            "{}: axis {} out of range for shape {:?}",
            component, axis, shape
        ))
    })?;
    if actual > capacity {
        return Err(RecognitionError::dimension_mismatch(
            component, capacity, actual,
        ));
    }
    Ok(())
}
