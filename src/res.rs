use axum::{debug_handler, response::{Html, IntoResponse}};

use crate::Markdown;

#[macro_export]
macro_rules! include_res {
    (bytes, $p:expr) => {
        include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/res", $p))
    };
    (str, $p:expr) => {
        include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/res", $p))
    };
}

#[debug_handler]
pub async fn console() -> impl IntoResponse {
    Html(include_res!(str, "/pages/index.html"))
}

#[debug_handler]
pub async fn help() -> impl IntoResponse {
    Markdown(include_res!(str, "/pages/help.md"))
}
