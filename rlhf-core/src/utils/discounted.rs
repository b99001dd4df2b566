use candle_core::{DType, Result, Tensor, bail};

/// Right to left discounted sum, `out[t] = x[t] + gamma * out[t + 1]`.
pub fn discounted_cumsum(xs: &[f32], gamma: f32) -> Vec<f32> {
    let mut out = vec![0.; xs.len()];
    let mut acc = 0.;
    for (t, x) in xs.iter().enumerate().rev() {
        acc = x + gamma * acc;
        out[t] = acc;
    }
    out
}

/// Discounted cumulative sum of a `(1, T)` or `(T,)` sequence, returned as a `(T,)` tensor
/// on the input device.
pub fn discounted_cumsum_right(x: &Tensor, gamma: f32) -> Result<Tensor> {
    let seq = match x.dims() {
        [_] => x.clone(),
        [1, _] => x.squeeze(0)?,
        dims => bail!("discounted_cumsum_right expects a (1, T) sequence, got {dims:?}"),
    };
    let xs = seq.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    let len = xs.len();
    Tensor::from_vec(discounted_cumsum(&xs, gamma), len, x.device())
}

/// Applies [`discounted_cumsum_right`] to every row of a `(rows, T)` tensor independently.
pub fn discounted_cumsum_rows(x: &Tensor, gamma: f32) -> Result<Tensor> {
    let (rows, cols) = x.dims2()?;
    let data: Vec<f32> = x
        .to_dtype(DType::F32)?
        .to_vec2::<f32>()?
        .iter()
        .flat_map(|row| discounted_cumsum(row, gamma))
        .collect();
    Tensor::from_vec(data, (rows, cols), x.device())
}
