use candle_core::{DType, Result, Tensor, bail};

/// Flattens `x` and keeps the entries where `mask` is nonzero, in row major order.
pub fn masked_select(x: &Tensor, mask: &Tensor) -> Result<Tensor> {
    if x.dims() != mask.dims() {
        bail!(
            "masked_select shape mismatch: values {:?}, mask {:?}",
            x.dims(),
            mask.dims()
        );
    }
    let indices: Vec<u32> = mask
        .flatten_all()?
        .to_dtype(DType::U32)?
        .to_vec1::<u32>()?
        .into_iter()
        .enumerate()
        .filter(|(_, m)| *m != 0)
        .map(|(i, _)| i as u32)
        .collect();
    let len = indices.len();
    let indices = Tensor::from_vec(indices, len, x.device())?;
    x.flatten_all()?.index_select(&indices, 0)
}
