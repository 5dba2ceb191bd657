pub mod distance;
pub mod feature_store;
pub mod histogram;
pub mod pixel;
pub mod weights;
