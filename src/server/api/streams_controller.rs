use axum::{Extension, Json, Router, routing::post};
use tracing::info;

use crate::server::{
    dtos::{ExtractorOutput, StreamSet},
    extractors::ValidatedJson,
    services::{ProxyServices, StreamSelector},
};

pub struct StreamsController;

impl StreamsController {
    pub fn app() -> Router {
        Router::new().route("/streams/normalize", post(Self::normalize))
    }

    /// extractor output in, ranked and proxy-wrapped stream set out
    async fn normalize(
        Extension(services): Extension<ProxyServices>,
        ValidatedJson(output): ValidatedJson<ExtractorOutput>,
    ) -> Json<StreamSet> {
        let submitted = output.streams.len();
        let set = services.wrapper.wrap_stream_set(StreamSelector::normalize(output));

        info!(
            "normalized {} of {} submitted streams",
            set.streams().len(),
            submitted
        );

        Json(set)
    }
}
