// THEORY:
// `baby_host` is the presentation adapter. It never drives the robot; it only reads
// the handles the runtime hands out:
//
// *   `StatusBroadcaster` snapshots become `DashboardView`, the JSON document the
//     dashboard polls at `/status`;
// *   `LatestFrame` feeds the `/video_feed` MJPEG stream.
//
// The HTTP server itself sits behind the `web` feature so the core can be built and
// tested without the web stack.

use baby_step::motion_detector::Detection;
use baby_step::runtime::ShutdownToken;
use baby_step::status::{HeadMovement, MovementProgress, StatusSnapshot};
use baby_step::{LatestFrame, StatusBroadcaster};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// The JSON document served at `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardView {
    pub status: String,
    pub detection_info: Option<Detection>,
    /// Base64 of the annotated JPEG that belongs to `detection_info`.
    pub last_detection_image: Option<String>,
    pub movement_info: Option<MovementProgress>,
    pub head_movement: Option<HeadMovement>,
    pub history: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&StatusSnapshot> for DashboardView {
    fn from(snapshot: &StatusSnapshot) -> Self {
        let (detection_info, last_detection_image) = match &snapshot.detection {
            Some(record) => (
                Some(record.detection.clone()),
                record.image.as_ref().map(|image| STANDARD.encode(&image.data)),
            ),
            None => (None, None),
        };
        Self {
            status: snapshot.status.clone(),
            detection_info,
            last_detection_image,
            movement_info: snapshot.movement.clone(),
            head_movement: snapshot.head.clone(),
            history: snapshot.history.iter().cloned().collect(),
            updated_at: snapshot.updated_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5000".to_string(),
        }
    }
}

/// Shared handles the server reads from.
#[derive(Clone)]
pub struct HostHandles {
    pub status: StatusBroadcaster,
    pub frames: LatestFrame,
    pub shutdown: ShutdownToken,
}

#[cfg(feature = "web")]
pub async fn start_server(handles: HostHandles, cfg: ServerConfig) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    use std::convert::Infallible;

    use axum::body::Body;
    use axum::extract::State;
    use axum::http::{HeaderValue, header};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::{Json, Router};
    use baby_step::frame::{FrameFormat, FramePacket, encode_rgb};
    use bytes::Bytes;
    use futures_util::StreamExt;
    use tracing::{error, info, warn};

    const BOUNDARY: &str = "frame";

    /// JPEG bytes for one frame, transcoding when the camera produced another format.
    fn jpeg_bytes(frame: &FramePacket) -> Option<Bytes> {
        if frame.format == FrameFormat::Jpeg {
            return Some(Bytes::copy_from_slice(&frame.data));
        }
        let transcoded = frame
            .decode()
            .and_then(|image| encode_rgb(&image.to_rgb8(), FrameFormat::Jpeg));
        match transcoded {
            Ok(data) => Some(Bytes::from(data)),
            Err(e) => {
                warn!(frame_id = frame.frame_id, error = %e, "could not transcode frame for video feed");
                None
            }
        }
    }

    async fn status(State(handles): State<HostHandles>) -> Json<DashboardView> {
        Json(DashboardView::from(&handles.status.snapshot()))
    }

    async fn video_feed(State(handles): State<HostHandles>) -> Response {
        let mut frames = handles.frames.subscribe();
        let shutdown = handles.shutdown.clone();
        let parts = async_stream::stream! {
            loop {
                tokio::select! {
                    changed = frames.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
                let frame = frames.borrow_and_update().clone();
                let Some(jpeg) = frame.as_ref().and_then(jpeg_bytes) else {
                    continue;
                };
                let mut part = format!(
                    "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                    jpeg.len()
                )
                .into_bytes();
                part.extend_from_slice(&jpeg);
                part.extend_from_slice(b"\r\n");
                yield Bytes::from(part);
            }
        };

        let mut response = Body::from_stream(parts.map(Ok::<_, Infallible>)).into_response();
        let content_type = format!("multipart/x-mixed-replace; boundary={BOUNDARY}");
        if let Ok(value) = HeaderValue::from_str(&content_type) {
            response.headers_mut().insert(header::CONTENT_TYPE, value);
        }
        response
    }

    let app = Router::new()
        .route("/status", get(status))
        .route("/video_feed", get(video_feed))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(handles.clone());

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    info!(addr = %cfg.bind_addr, "status server listening");
    handles.status.status("Server started");

    let shutdown = handles.shutdown.clone();
    let server = tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move { shutdown.cancelled().await });
        if let Err(e) = serve.await {
            error!(error = %e, "status server failed");
        }
    });

    Ok(server)
}

#[cfg(not(feature = "web"))]
pub async fn start_server(_handles: HostHandles, _cfg: ServerConfig) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    Err(anyhow::anyhow!("web feature not enabled for baby_host"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use baby_step::actuation::HeadPosition;
    use baby_step::annotate::EncodedImage;
    use baby_step::core_modules::smart_blob::{BoundingBox, Point};
    use baby_step::frame::FrameFormat;
    use baby_step::status::{DetectionEvent, StatusEvent};

    fn detection() -> Detection {
        Detection {
            bearing_x: -14.5,
            bearing_y: 2.0,
            distance: 3.2,
            area: 640,
            bbox: BoundingBox { x: 4, y: 6, w: 28, h: 30 },
            center: Point { x: 18.0, y: 21.0 },
            frame_center: Point { x: 32.0, y: 24.0 },
            head: HeadPosition::default(),
            frame_id: 9,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn empty_snapshot_serializes_with_every_key() {
        let status = StatusBroadcaster::default();
        let json = serde_json::to_value(DashboardView::from(&status.snapshot())).expect("json");
        for key in [
            "status",
            "detection_info",
            "last_detection_image",
            "movement_info",
            "head_movement",
            "history",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert_eq!(json["status"], "Initializing...");
        assert!(json["detection_info"].is_null());
    }

    #[test]
    fn detection_image_is_base64_encoded() {
        let status = StatusBroadcaster::default();
        status.publish(StatusEvent::Detection(DetectionEvent::Motion {
            detection: detection(),
            image: Some(EncodedImage {
                format: FrameFormat::Jpeg,
                data: vec![0xFF, 0xD8, 0xFF].into(),
            }),
        }));
        let view = DashboardView::from(&status.snapshot());
        assert_eq!(view.last_detection_image.as_deref(), Some("/9j/"));
        let json = serde_json::to_value(&view).expect("json");
        assert_eq!(json["detection_info"]["bearing_x"], -14.5);
        assert_eq!(json["history"].as_array().map(|h| h.len()), Some(1));
    }

    #[tokio::test]
    #[cfg(not(feature = "web"))]
    async fn server_requires_web_feature() {
        let handles = HostHandles {
            status: StatusBroadcaster::default(),
            frames: LatestFrame::new(),
            shutdown: ShutdownToken::new(),
        };
        assert!(start_server(handles, ServerConfig::default()).await.is_err());
    }
}
