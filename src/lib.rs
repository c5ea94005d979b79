pub mod api;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod messaging;
pub mod model;
pub mod presentation;
pub mod res;
pub mod storage;

use std::ops::Deref;
use std::sync::Arc;

use axum::{extract::FromRef, http::StatusCode, response::{Html, IntoResponse, Response}};
use serde_json::Value;

use crate::coordinator::Coordinator;
use crate::error::{DecodeError, ReplicationError};
use crate::presentation::FeedPresenter;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub presenter: Arc<FeedPresenter>,
}

pub trait GetField {
    fn get_str_field(&self, field: &str) -> Result<String, DecodeError>;
    fn get_obj_field(&self, field: &str) -> Result<&Value, DecodeError>;
}

impl GetField for serde_json::Value {
    fn get_str_field(&self, field: &str) -> Result<String, DecodeError> {
        Ok(
            self.get_obj_field(field)?
            .as_str()
            .ok_or_else(|| DecodeError::NotString(field.to_owned()))?
            .to_owned()
        )
    }

    fn get_obj_field(&self, field: &str) -> Result<&Value, DecodeError> {
        self.get(field)
        .ok_or_else(|| DecodeError::Missing(field.to_owned()))
    }
}

/// Input the caller got wrong; answered with 400.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct BadRequest(pub String);

pub type AppResult<T> = Result<T, AppError>;
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = if self.0.is::<BadRequest>() {
            StatusCode::BAD_REQUEST
        } else if let Some(err) = self.0.downcast_ref::<ReplicationError>() {
            if err.is_invalid() {
                StatusCode::BAD_REQUEST
            } else if err.is_hard() {
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            }
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };

        if status.is_server_error() {
            tracing::error!(%status, "request failed: {:#}", self.0);
        }
        (status, format!("{:#}", self.0)).into_response()
    }
}

impl From<String> for AppError {
    fn from(err: String) -> Self {
        Self(anyhow::Error::msg(err))
    }
}

impl From<&str> for AppError {
    fn from(err: &str) -> Self {
        Self(anyhow::Error::msg(err.to_owned()))
    }
}

macro_rules! apperr_impl {
    ($E:ty) => {
        impl From<$E> for AppError {
            fn from(err: $E) -> Self {
                Self(anyhow::Error::from(err))
            }
        }
    };
}

apperr_impl!(BadRequest);
apperr_impl!(ReplicationError);
apperr_impl!(serde_json::Error);
apperr_impl!(axum::Error);

pub struct Markdown<T>(pub T);

impl<T> IntoResponse for Markdown<T>
where
    T: Deref<Target = str>
{
    fn into_response(self) -> axum::response::Response {
        use pulldown_cmark::{Options, Parser};

        let parser = Parser::new_ext(&*self.0, Options::ENABLE_TABLES);

        let mut html_output = String::new();
        pulldown_cmark::html::push_html(&mut html_output, parser);
        Html(html_output).into_response()
    }
}
