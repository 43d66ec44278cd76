pub mod discount;
pub mod pricing;
pub mod refund;
pub mod stock;
