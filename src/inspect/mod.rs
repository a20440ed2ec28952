//! Inspection HTTP surface
//!
//! Read-only introspection of the room model, live statuses, and cached
//! snapshots with detection overlays. Unauthenticated by design; bind it
//! somewhere friendly. The server restarts from the config listener chain
//! when `details_port` changes.

pub mod markup;

use crate::error::Error;
use crate::state::AppContext;
use axum::{
    extract::{Query, State},
    http::{header, Method},
    response::{Html, IntoResponse, Response},
    routing::any,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tower_http::trace::TraceLayer;

/// Restartable wrapper around the axum server. One mutex tracks "server
/// running": the serving task holds it for its lifetime, so a restart can
/// wait for shutdown by acquiring it.
pub struct InspectServer {
    ctx: AppContext,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    running: Arc<Mutex<()>>,
}

impl InspectServer {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            ctx,
            shutdown: Mutex::new(None),
            running: Arc::new(Mutex::new(())),
        }
    }

    /// Bind `details_port` and serve until `restart` (or process exit).
    pub async fn start(&self) -> crate::error::Result<()> {
        let mut shutdown = self.shutdown.lock().await;
        if shutdown.is_some() {
            return Err(crate::error::Error::Internal(
                "inspection server already running".to_string(),
            ));
        }

        let port = self.ctx.settings.get_i64("details_port") as u16;
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
        tracing::info!(addr = %listener.local_addr()?, "inspection server listening");

        let (tx, rx) = oneshot::channel::<()>();
        *shutdown = Some(tx);

        let app = router(self.ctx.clone());
        let guard = self.running.clone().lock_owned().await;
        tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = rx.await;
            });
            if let Err(e) = serve.await {
                tracing::warn!(error = %e, "problem serving inspection server");
            }
            tracing::debug!("inspection server shutdown");
            drop(guard);
        });
        Ok(())
    }

    /// Shut the server down if it is running, wait for the serving task to
    /// finish, and start again. Idempotent when already stopped.
    pub async fn restart(&self) {
        tracing::debug!("restarting inspection server");
        {
            let mut shutdown = self.shutdown.lock().await;
            if let Some(tx) = shutdown.take() {
                let _ = tx.send(());
            }
        }
        // the serving task releases this lock on its way out
        drop(self.running.lock().await);
        if let Err(e) = self.start().await {
            tracing::error!(error = %e, "error starting inspection server");
        }
    }
}

pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/image", any(image_overlay))
        .route("/room", any(room_overview))
        .route("/room_status", any(status_overview))
        .route("/model", any(model_api))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

#[derive(Debug, Default, Deserialize)]
struct ImageQuery {
    #[serde(default)]
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct RoomQuery {
    #[serde(default)]
    room: String,
}

fn bad_method() -> Response {
    Error::BadRequest("Bad Request Method\n".to_string()).into_response()
}

/// `GET /image?id=<picture topic>`: the cached snapshot with overlays.
async fn image_overlay(
    State(ctx): State<AppContext>,
    method: Method,
    Query(query): Query<ImageQuery>,
) -> Response {
    if method != Method::GET {
        return bad_method();
    }
    let Some(cached) = ctx.cache.get(&query.id).await else {
        return Error::NotFound("Unknown ID".to_string()).into_response();
    };
    match markup::render(&cached.image, &cached.detection.predictions) {
        Ok(jpeg) => ([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response(),
        Err(e) => {
            tracing::error!(id = %query.id, error = %e, "error rendering image");
            Error::Internal("error rendering image".to_string()).into_response()
        }
    }
}

/// `GET /room?room=<name>`: image links for each of the room's cameras.
/// An unmatched room renders the empty page shell.
async fn room_overview(
    State(ctx): State<AppContext>,
    method: Method,
    Query(query): Query<RoomQuery>,
) -> Response {
    if method != Method::GET {
        return bad_method();
    }
    let model = ctx.model.snapshot().await;
    let mut page = String::from("<html><body>");
    for room in model.rooms.iter().filter(|r| r.name == query.room) {
        for topic in &room.picture_topics {
            page.push_str(&format!("<h3>{}</h3>", topic));
            page.push_str(&format!("<img src=\"/image?id={}\" /><br>", topic));
        }
    }
    page.push_str("</body></html>");
    Html(page).into_response()
}

/// `GET /room_status`: one table row per configured room.
async fn status_overview(State(ctx): State<AppContext>, method: Method) -> Response {
    if method != Method::GET {
        return bad_method();
    }
    let now = chrono::Utc::now().timestamp();
    let model = ctx.model.snapshot().await;
    let mut page = String::from("<html><body><table>");
    page.push_str(
        "<tr><th>Room</th><th>Last Occupied (seconds ago)</th><th>Motion State</th><th>Timeout</th></tr>",
    );
    for room in &model.rooms {
        let status = ctx.status.snapshot(&room.name).await;
        page.push_str("<tr>");
        page.push_str(&format!(
            "<td><a href=\"/room?room={}\">{}</a></td>",
            room.name, room.name
        ));
        page.push_str(&format!("<td>{}</td>", now - status.last_occupied_at));
        page.push_str(&format!("<td>{}</td>", status.motion_on));
        page.push_str(&format!("<td>{}</td>", model.occupancy_period(&room.name)));
        page.push_str("</tr>");
    }
    page.push_str("</table></body></html>");
    Html(page).into_response()
}

#[derive(Debug, Serialize)]
struct ModelApiItem {
    room: crate::model::Room,
    ai: HashMap<String, crate::detector::Detection>,
}

/// `GET /model[?room=<name>]`: room config plus cached inference results.
async fn model_api(
    State(ctx): State<AppContext>,
    method: Method,
    Query(query): Query<RoomQuery>,
) -> Response {
    if method != Method::GET {
        return bad_method();
    }
    let model = ctx.model.snapshot().await;
    let mut answer = HashMap::new();
    for room in &model.rooms {
        if !query.room.is_empty() && room.name != query.room {
            continue;
        }
        let ai = ctx.cache.detections_for(&room.picture_topics).await;
        answer.insert(
            room.name.clone(),
            ModelApiItem {
                room: room.clone(),
                ai,
            },
        );
    }
    if answer.is_empty() && !query.room.is_empty() {
        return Error::NotFound("Room not found".to_string()).into_response();
    }
    Json(answer).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusClient;
    use crate::detector::{Detection, DetectorClient, Prediction};
    use crate::image_pipeline::ImageCache;
    use crate::model::{Model, Room, SharedModel};
    use crate::settings::Settings;
    use crate::status_store::StatusStore;
    use bytes::Bytes;

    async fn test_ctx() -> AppContext {
        let settings = Arc::new(Settings::load());
        let model = SharedModel::new();
        model
            .replace(Model {
                rooms: vec![Room {
                    name: "kitchen".to_string(),
                    occupancy_topic: "hab/kitchen/occupancy".to_string(),
                    picture_topics: vec!["cam/kitchen".to_string()],
                    occupancy_period: 60,
                    ..Room::default()
                }],
                ..Model::default()
            })
            .await;
        AppContext {
            settings: settings.clone(),
            bus: Arc::new(BusClient::new(settings.clone())),
            model,
            status: Arc::new(StatusStore::new()),
            cache: Arc::new(ImageCache::new()),
            detector: Arc::new(DetectorClient::new(reqwest::Client::new(), settings)),
        }
    }

    async fn serve(ctx: AppContext) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(ctx);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn tiny_jpeg() -> Bytes {
        use image::{DynamicImage, Rgb, RgbImage};
        let canvas = RgbImage::from_pixel(120, 120, Rgb([90, 90, 90]));
        let mut out = std::io::Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(canvas)
            .write_to(&mut out, image::ImageFormat::Jpeg)
            .unwrap();
        Bytes::from(out.into_inner())
    }

    #[tokio::test]
    async fn image_endpoint_serves_overlay_and_errors() {
        let ctx = test_ctx().await;
        ctx.cache
            .insert(
                "cam/kitchen",
                tiny_jpeg(),
                Detection {
                    success: true,
                    timestamp: 1,
                    predictions: vec![Prediction {
                        label: "person".to_string(),
                        confidence: 0.9,
                        x_min: 10,
                        y_min: 10,
                        x_max: 50,
                        y_max: 50,
                    }],
                },
            )
            .await;
        let base = serve(ctx).await;
        let client = reqwest::Client::new();

        let ok = client
            .get(format!("{}/image?id=cam/kitchen", base))
            .send()
            .await
            .unwrap();
        assert_eq!(ok.status(), 200);
        assert_eq!(
            ok.headers()["content-type"].to_str().unwrap(),
            "image/jpeg"
        );
        assert!(!ok.bytes().await.unwrap().is_empty());

        let missing = client
            .get(format!("{}/image?id=nonexistent", base))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);

        let wrong_method = client
            .post(format!("{}/image?id=cam/kitchen", base))
            .send()
            .await
            .unwrap();
        assert_eq!(wrong_method.status(), 400);
    }

    #[tokio::test]
    async fn room_and_status_pages_render() {
        let ctx = test_ctx().await;
        ctx.status.mark_occupied("kitchen", 1).await;
        let base = serve(ctx).await;
        let client = reqwest::Client::new();

        let room = client
            .get(format!("{}/room?room=kitchen", base))
            .send()
            .await
            .unwrap();
        assert_eq!(room.status(), 200);
        let body = room.text().await.unwrap();
        assert!(body.contains("/image?id=cam/kitchen"));

        // an unmatched room falls through to the empty page shell
        let unknown = client
            .get(format!("{}/room?room=lounge", base))
            .send()
            .await
            .unwrap();
        assert_eq!(unknown.status(), 200);
        assert_eq!(
            unknown.text().await.unwrap(),
            "<html><body></body></html>"
        );

        let status = client
            .get(format!("{}/room_status", base))
            .send()
            .await
            .unwrap();
        let body = status.text().await.unwrap();
        assert!(body.contains("kitchen"));
        assert!(body.contains("<td>60</td>"));
    }

    #[tokio::test]
    async fn model_api_returns_rooms_and_cached_results() {
        let ctx = test_ctx().await;
        ctx.cache
            .insert("cam/kitchen", tiny_jpeg(), Detection::default())
            .await;
        let base = serve(ctx).await;
        let client = reqwest::Client::new();

        let all: serde_json::Value = client
            .get(format!("{}/model", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(all["kitchen"]["room"]["occupancy_topic"]
            .as_str()
            .unwrap()
            .contains("kitchen"));
        assert!(all["kitchen"]["ai"].get("cam/kitchen").is_some());

        let missing = client
            .get(format!("{}/model?room=lounge", base))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);
    }
}
