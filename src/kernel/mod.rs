pub mod boolean;
pub mod numeric;
pub mod reduce;
