use axum::{
    Json,
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use dvpn_common::VERSION;
use serde_json::{Value, json};

use crate::error::WebError;

pub(crate) mod info;
pub(crate) mod session;

pub struct ApiResponse {
    pub json: Value,
    pub status: StatusCode,
}

impl ApiResponse {
    #[must_use]
    pub fn new(json: Value, status: StatusCode) -> Self {
        Self { json, status }
    }
}

impl From<WebError> for ApiResponse {
    fn from(web_error: WebError) -> ApiResponse {
        match web_error {
            WebError::Admission(err) => {
                let status = err.status();
                if status.is_server_error() {
                    error!("{err}");
                } else {
                    debug!("Rejected session: {err}");
                }
                ApiResponse::new(json!({ "code": err.code(), "msg": err.to_string() }), status)
            }
            WebError::BadRequest(msg) => {
                debug!("{msg}");
                ApiResponse::new(json!({ "code": 2, "msg": msg }), StatusCode::BAD_REQUEST)
            }
            WebError::PeerService(err) => {
                error!("{err}");
                ApiResponse::new(
                    json!({ "code": 1, "msg": "Peer service unavailable" }),
                    StatusCode::BAD_GATEWAY,
                )
            }
        }
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let api_response = ApiResponse::from(self);
        api_response.into_response()
    }
}

impl IntoResponse for ApiResponse {
    fn into_response(self) -> Response {
        let mut response = Json(self.json).into_response();
        response.headers_mut().insert(
            HeaderName::from_static("x-dvpn-version"),
            HeaderValue::from_static(VERSION),
        );
        *response.status_mut() = self.status;
        response
    }
}

pub type ApiResult = Result<ApiResponse, WebError>;
