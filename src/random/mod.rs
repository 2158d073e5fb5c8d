//! Random-sampling utilities used by the belief machinery.

mod truncated_normal;

pub use truncated_normal::TruncatedNormal;
