//! Lightweight validation helpers shared across layer components.
//!
//! Every helper takes a `context` label naming the tensor being checked
//! (e.g. `"linear.weight"`) so errors point at the offending argument. They
//! return `candle_core::Result<()>` so call sites can propagate errors without
//! panicking.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(context: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: expected shape {:?}, got {:?}",
            expected, actual
        )))
    }
}

/// Ensures a tensor has exactly `rank` dimensions.
pub fn expect_rank(context: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    let actual = tensor.rank();
    if actual == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: expected rank {rank}, got {actual} ({:?})",
            tensor.dims()
        )))
    }
}

/// Validates the `(batch, seq, hidden)` convention with a known hidden size.
pub fn expect_batch_seq_hidden(context: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    match tensor.dims() {
        [_, _, actual_hidden] if *actual_hidden == hidden => Ok(()),
        dims => Err(Error::Msg(format!(
            "{context}: expected (batch, seq, {hidden}) layout, got {:?}",
            dims
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(context: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: expected dtype in {:?}, got {:?}",
            allowed, dtype
        )))
    }
}

/// Checks two tensors share a dtype.
pub fn expect_same_dtype(
    left_context: &str,
    left: &Tensor,
    right_context: &str,
    right: &Tensor,
) -> Result<()> {
    if left.dtype() == right.dtype() {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{left_context} has dtype {:?} but {right_context} has dtype {:?}",
            left.dtype(),
            right.dtype()
        )))
    }
}

/// Parameters must be contiguous so in-place updates keep their layout.
pub fn expect_contiguous(context: &str, tensor: &Tensor) -> Result<()> {
    if tensor.is_contiguous() {
        Ok(())
    } else {
        Err(Error::Msg(format!("{context}: tensor must be contiguous")))
    }
}

/// Rejects casts between float and integer dtypes, which silently truncate.
pub fn ensure_cast_supported(context: &str, from: DType, to: DType) -> Result<()> {
    if from == to || (from.is_float() && to.is_float()) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: unsupported cast from {:?} to {:?}",
            from, to
        )))
    }
}
