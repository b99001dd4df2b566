// Thin newtypes so that loss plumbing reads by meaning instead of by tensor position.
use candle_core::Tensor;
use derive_more::{Deref, DerefMut, Display};

/// Log-probability of each realized token, shape `(episodes, positions)`.
#[derive(Deref, DerefMut, Debug, Display, Clone)]
pub struct Logp(pub Tensor);

/// Entropy of the next token distribution at each position, shape `(episodes, positions)`.
#[derive(Deref, DerefMut, Debug, Display, Clone)]
pub struct Entropy(pub Tensor);

#[derive(Deref, DerefMut, Debug, Display, Clone)]
pub struct LogpDiff(pub Tensor);

#[derive(Deref, DerefMut, Debug, Display, Clone)]
pub struct ValuesPred(pub Tensor);

#[derive(Deref, DerefMut, Debug, Display)]
pub struct PolicyLoss(pub Tensor);

#[derive(Deref, DerefMut, Debug, Display)]
pub struct ValueLoss(pub Tensor);
