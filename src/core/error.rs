use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::StatusCode;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level error type. The api layer is the only place these are turned
/// into HTTP responses; everything below it propagates them verbatim.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("bad request: {0}")]
	BadRequest(String),

	#[error("invalid position: {0}")]
	InvalidPosition(String),

	#[error("session expired")]
	SessionExpired,

	/// The request was superseded by a newer request on the same session.
	#[error("request superseded by newer request")]
	Superseded,

	#[error("missing or malformed access token")]
	MissingToken,

	/// The upstream rejected the bearer token.
	#[error("upstream rejected credentials: {0}")]
	Unauthorized(String),

	/// The upstream could not be reached or answered with garbage. Only
	/// surfaced to clients during connection creation; the poller absorbs
	/// these with backoff once a session is live.
	#[error("upstream failure: {0}")]
	BadGateway(String),

	#[error("storage failure: {0}")]
	Storage(String),

	#[error(transparent)]
	Reqwest(#[from] reqwest::Error),

	#[error(transparent)]
	Json(#[from] serde_json::Error),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Figment(#[from] figment::Error),
}

impl Error {
	pub fn bad_request(message: impl Into<String>) -> Self {
		Self::BadRequest(message.into())
	}

	pub fn storage(message: impl Into<String>) -> Self { Self::Storage(message.into()) }

	pub fn status_code(&self) -> StatusCode {
		match self {
			| Self::BadRequest(_)
			| Self::InvalidPosition(_)
			| Self::SessionExpired
			| Self::Superseded
			| Self::MissingToken => StatusCode::BAD_REQUEST,
			| Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
			| Self::BadGateway(_) | Self::Reqwest(_) => StatusCode::BAD_GATEWAY,
			| Self::Storage(_) | Self::Json(_) | Self::Io(_) | Self::Figment(_) =>
				StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	/// The JSON error document sent over the wire.
	pub fn to_body(&self) -> Bytes {
		let body = serde_json::json!({ "error": self.to_string() });
		serde_json::to_vec(&body).unwrap_or_default().into()
	}
}

impl IntoResponse for Error {
	fn into_response(self) -> Response {
		let status = self.status_code();
		if status.is_server_error() {
			tracing::error!(error = %self, "request failed");
		}

		let headers = [(http::header::CONTENT_TYPE, "application/json")];
		(status, headers, self.to_body()).into_response()
	}
}

#[cfg(test)]
mod tests {
	use http::StatusCode;

	use super::Error;

	#[test]
	fn client_errors_are_400() {
		assert_eq!(Error::SessionExpired.status_code(), StatusCode::BAD_REQUEST);
		assert_eq!(
			Error::InvalidPosition("abc".to_owned()).status_code(),
			StatusCode::BAD_REQUEST
		);
		assert_eq!(Error::MissingToken.status_code(), StatusCode::BAD_REQUEST);
	}

	#[test]
	fn upstream_errors_are_502() {
		assert_eq!(
			Error::BadGateway("connect refused".to_owned()).status_code(),
			StatusCode::BAD_GATEWAY
		);
	}

	#[test]
	fn session_expired_body_names_the_session() {
		let body = Error::SessionExpired.to_body();
		let text = std::str::from_utf8(&body).unwrap();
		assert!(text.contains("session expired"), "body was {text}");
	}
}
