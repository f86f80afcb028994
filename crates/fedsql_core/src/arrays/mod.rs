pub mod datatype;
pub mod field;
pub mod scalar;
