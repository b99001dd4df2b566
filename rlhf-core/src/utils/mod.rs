pub mod discounted;
pub mod masking;

pub use discounted::{discounted_cumsum, discounted_cumsum_right, discounted_cumsum_rows};
pub use masking::masked_select;
