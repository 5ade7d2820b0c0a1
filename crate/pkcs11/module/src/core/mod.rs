pub mod attribute;
pub mod certificate;
pub mod object;
