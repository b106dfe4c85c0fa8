use crate::err::osc_error::OscError;

pub mod osc_error;

pub type OResult<T> = Result<T, OscError>;
