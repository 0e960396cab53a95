use axum_extra::{
	TypedHeader,
	headers::{Authorization, authorization::Bearer},
};
use slipstream_core::{Error, Result};

/// The bearer token is mandatory on every request: it is both the client's
/// credential and, via the upstream's attestation, the device identity the
/// session is bound to.
pub(crate) fn require_bearer(
	bearer: Option<&TypedHeader<Authorization<Bearer>>>,
) -> Result<&str> {
	match bearer {
		| Some(TypedHeader(Authorization(bearer))) => Ok(bearer.token()),
		| None => Err(Error::MissingToken),
	}
}
