use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;

use common::coords::Coords;
use common::error::BlockError;
use common::pixel::{encode_pixels, Color};
use common::repo::BlockRepo;

use crate::rate_limit::{self, RateLimiter};

#[derive(Clone)]
pub struct AppState {
    pub blocks: Arc<dyn BlockRepo>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

pub fn router(state: AppState) -> Router {
    // Double routes so the empty coordinate string is still bound to the
    // handlers: reading the root block is valid, and an empty paint target
    // should report 400 rather than 404.
    Router::new()
        .route("/api/block/{coords}", get(get_block))
        .route("/api/block/", get(get_block_root))
        .route("/api/paint/{coords}", post(paint))
        .route("/api/paint/", post(paint_root))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_mw,
        ))
        .with_state(state)
}

#[derive(Deserialize, Default)]
struct PaintBody {
    color: Option<String>,
}

async fn get_block(State(state): State<AppState>, Path(coords): Path<String>) -> Response {
    handle_get_block(&state, &coords)
}

async fn get_block_root(State(state): State<AppState>) -> Response {
    handle_get_block(&state, "")
}

async fn paint(
    State(state): State<AppState>,
    Path(coords): Path<String>,
    body: Option<Json<PaintBody>>,
) -> Response {
    handle_paint(&state, &coords, body.map(|Json(b)| b).unwrap_or_default())
}

async fn paint_root(State(state): State<AppState>, body: Option<Json<PaintBody>>) -> Response {
    handle_paint(&state, "", body.map(|Json(b)| b).unwrap_or_default())
}

fn handle_get_block(state: &AppState, coords: &str) -> Response {
    let coords = match Coords::from_base64(coords) {
        Ok(coords) => coords,
        Err(err) => return error_response(err),
    };

    match state.blocks.get_block(&coords) {
        Ok(block) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "code": "BLOCK",
                "pixels": encode_pixels(&block.pixels),
                "lastUpdated": block.last_updated,
            })),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

fn handle_paint(state: &AppState, coords: &str, body: PaintBody) -> Response {
    let Some(color) = body.color else {
        return error_response(BlockError::bad("`body.color` is missing"));
    };

    let coords = match Coords::from_base64(coords) {
        Ok(coords) => coords,
        Err(err) => return error_response(err),
    };
    let color = match Color::parse(&color) {
        Ok(color) => color,
        Err(err) => return error_response(err),
    };

    match state.blocks.set_pixel(&coords, color) {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "code": "PIXEL_SET" })),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

/// Map a repository error onto the HTTP envelope. Internal conditions are
/// logged and hidden from the client.
fn error_response(err: BlockError) -> Response {
    let (status, code) = match &err {
        BlockError::BadArgument(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
        BlockError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        BlockError::PixelDry => (StatusCode::BAD_REQUEST, "PIXEL_DRY"),
        BlockError::MaxDepthExceeded => (StatusCode::BAD_REQUEST, "MAX_DEPTH_EXCEEDED"),
        BlockError::Internal(_) => {
            tracing::error!("internal error serving request: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "code": "INTERNAL_ERROR",
                    "message": "An internal error occurred and has been logged.",
                })),
            )
                .into_response();
        }
    };

    (
        status,
        Json(serde_json::json!({
            "code": code,
            "message": err.to_string(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use common::clock::{Clock, TestClock};
    use common::pixel::Pixel;
    use common::repo::{MemBlockRepo, BLOCK_PIXELS};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    struct Tester {
        router: Router,
        clock: Arc<TestClock>,
    }

    fn tester(rate_limited: bool) -> Tester {
        let clock = Arc::new(TestClock::new());
        let blocks: Arc<dyn BlockRepo> = Arc::new(MemBlockRepo::new(clock.clone()));
        let rate_limiter = rate_limited.then(|| {
            let limiter_clock: Arc<dyn Clock> = clock.clone();
            Arc::new(RateLimiter::new(100, 10, limiter_clock))
        });
        let router = router(AppState {
            blocks,
            rate_limiter,
        });
        Tester { router, clock }
    }

    impl Tester {
        async fn request(&self, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, serde_json::Value) {
            let mut builder = Request::builder().method(method).uri(uri);
            let body = match body {
                Some(json) => {
                    builder = builder.header(header::CONTENT_TYPE, "application/json");
                    Body::from(json.to_string())
                }
                None => Body::empty(),
            };
            let request = builder.body(body).unwrap();

            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
            (status, value)
        }

        async fn get(&self, uri: &str) -> (StatusCode, serde_json::Value) {
            self.request("GET", uri, None).await
        }

        async fn paint(&self, coords: &str, body: Option<&str>) -> (StatusCode, serde_json::Value) {
            self.request("POST", &format!("/api/paint/{coords}"), body).await
        }
    }

    fn decode_pixels(body: &serde_json::Value) -> Vec<Pixel> {
        let bytes = URL_SAFE_NO_PAD
            .decode(body["pixels"].as_str().unwrap())
            .unwrap();
        assert_eq!(bytes.len(), BLOCK_PIXELS * 4);
        bytes
            .chunks_exact(4)
            .map(|c| Pixel(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
            .collect()
    }

    /// A depth-7 coordinate: paint lands in a depth-1 block and bubbles one
    /// pixel into the root block.
    fn deep_coords() -> Coords {
        let mut coords = Coords::new();
        for _ in 0..7 {
            coords = coords.down(1, 0);
        }
        coords
    }

    #[tokio::test]
    async fn paint_then_read_the_root_block() {
        let t = tester(false);
        let coords = deep_coords();

        let (status, body) = t.paint(&coords.to_base64(), Some(r#"{"color":"f00"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"], "PIXEL_SET");

        // The painted pixel sits in its own block with the PAINTED flag.
        let (status, body) = t.get(&format!("/api/block/{}", coords.parent_of_pixel().to_base64())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"], "BLOCK");
        let pixels = decode_pixels(&body);
        let painted = pixels[coords.pixel_index()];
        assert!(painted.is_painted());
        assert_eq!(painted.painted(), Color(0x00F));

        // The bubbled color shows up in the root block with positive alpha.
        let (status, body) = t.get("/api/block/").await;
        assert_eq!(status, StatusCode::OK);
        let pixels = decode_pixels(&body);
        let parent = coords.up(1);
        let inherited = pixels[parent.pixel_index()].inherited();
        assert_eq!(inherited & 0x0FFF, 0x00F);
        assert!(inherited >> 12 > 0);
        assert!(body["lastUpdated"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn painting_dries_after_the_timeout() {
        let t = tester(false);
        let coords = Coords::new()
            .down(0, 0)
            .down(0, 1)
            .down(1, 0)
            .down(1, 1)
            .down(0, 0)
            .down(1, 1);

        let body = r#"{"color":"0f0"}"#;
        let (status, _) = t.paint(&coords.to_base64(), Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = t.paint(&coords.to_base64(), Some(body)).await;
        assert_eq!(status, StatusCode::OK);

        // Depth 6 dries after 600 seconds.
        t.clock.advance(Duration::from_secs(601));
        let (status, body) = t.paint(&coords.to_base64(), Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "PIXEL_DRY");
    }

    #[tokio::test]
    async fn malformed_coordinates_are_rejected() {
        let t = tester(false);

        let (status, body) = t.paint("a@@b", Some(r#"{"color":"f00"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "BAD_REQUEST");
        assert!(body["message"].as_str().unwrap().contains("base64"));

        let (status, body) = t.get("/api/block/a@@b").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn missing_body_reports_the_field() {
        let t = tester(false);
        let coords = deep_coords();

        let (status, body) = t.paint(&coords.to_base64(), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "BAD_REQUEST");
        assert!(body["message"].as_str().unwrap().contains("body.color"));

        let (status, body) = t.paint(&coords.to_base64(), Some(r#"{}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().contains("body.color"));
    }

    #[tokio::test]
    async fn invalid_colors_are_rejected() {
        let t = tester(false);
        let coords = deep_coords().to_base64();

        for bad in ["", "ff", "ffff", "xyz", "f0 "] {
            let (status, body) = t
                .paint(&coords, Some(&format!(r#"{{"color":"{bad}"}}"#)))
                .await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "color {bad:?}");
            assert_eq!(body["code"], "BAD_REQUEST");
        }
    }

    #[tokio::test]
    async fn shallow_paint_targets_are_bad_requests() {
        let t = tester(false);

        // The empty coordinate string cannot address a pixel.
        let (status, body) = t.paint("", Some(r#"{"color":"f00"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn unknown_blocks_are_not_found() {
        let t = tester(false);
        let coords = Coords::new().down(1, 1).to_base64();

        let (status, body) = t.get(&format!("/api/block/{coords}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn rate_limit_denies_past_burst_and_refills() {
        let t = tester(true);
        let coords = deep_coords().to_base64();
        let body = r#"{"color":"f00"}"#;

        for _ in 0..10 {
            let (status, _) = t.paint(&coords, Some(body)).await;
            assert_eq!(status, StatusCode::OK);
        }

        let (status, body_json) = t.paint(&coords, Some(body)).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_json["code"], "RATE_LIMIT");

        // Reads share the same quota.
        let (status, _) = t.get("/api/block/").await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

        t.clock.advance(Duration::from_millis(100));
        let (status, _) = t.paint(&coords, Some(body)).await;
        assert_eq!(status, StatusCode::OK);
    }
}
