//! HTTP and websocket surface. Everything here is glue: decode the
//! request, call the right handle, encode the result. The interesting
//! part is the Moonraker-compatible JSON-RPC socket at `/websocket`.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_stream::stream;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::Response,
    routing::{get, post},
    Extension, Json, Router,
};
use common::{
    api,
    rpc::{RpcNotification, RpcRequest, RpcResponse},
    status::{PrinterInfo, PrinterState, SdFileEntry},
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::{select, sync::mpsc};
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::{
    gcode_store::GcodeStore,
    job::JobHandle,
    objects::ObjectModelHandle,
    oneway_websocket::send_stream,
    printer::PrinterHandle,
    server_result::{ServerError, ServerResult},
    util::console::ConsoleLog,
};

#[derive(Clone)]
pub struct AppState {
    pub printer: PrinterHandle,
    pub job: JobHandle,
    pub objects: ObjectModelHandle,
    pub store: Arc<dyn GcodeStore>,
    pub console: Arc<ConsoleLog>,
}

pub async fn run_server(listen: String, state: AppState) {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route(api::RPC_WEBSOCKET, get(rpc_websocket))
        .route(api::CONSOLE_WEBSOCKET, get(listen_console))
        .route(api::PRINTER_INFO, get(printer_info))
        .route(api::RUN_GCODE_SCRIPT, post(run_gcode_script))
        .route(api::EMERGENCY_STOP, post(emergency_stop))
        .route(api::RESTART_PRINTER, post(restart_printer))
        .route(api::LIST_SD_FILES, get(list_sd_files))
        .route(api::PRINT_START, post(print_start))
        .route(api::PRINT_PAUSE, post(print_pause))
        .route(api::PRINT_RESUME, post(print_resume))
        .route(api::PRINT_CANCEL, post(print_cancel))
        .route(api::SERVER_INFO, get(server_info))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .layer(cors)
        .layer(Extension(state));

    info!(%listen, "serving printer api");
    axum::Server::bind(&listen.parse().expect("invalid listen address"))
        .serve(app.into_make_service())
        .await
        .unwrap();
}

/// Moonraker's eventtime is a monotonic-ish float of seconds; clients
/// only ever compare consecutive values.
fn eventtime() -> f64 {
    chrono::Local::now().timestamp_micros() as f64 / 1e6
}

async fn printer_info(state: Extension<AppState>) -> Json<PrinterInfo> {
    Json(state.printer.snapshot().info())
}

fn server_info_payload(state: &AppState) -> Value {
    let snapshot = state.printer.snapshot();
    json!({
        "klippy_connected": snapshot.state == PrinterState::Ready,
        "klippy_state": snapshot.state,
        "components": ["printer", "webserver"],
        "api_version": [1, 0, 0],
    })
}

async fn server_info(state: Extension<AppState>) -> Json<Value> {
    Json(server_info_payload(&state))
}

async fn run_gcode_script(
    state: Extension<AppState>,
    Json(body): Json<api::RunGcodeScript>,
) -> ServerResult<String> {
    state.printer.run_script(&body.script).await?;
    Ok("ok".to_string())
}

async fn emergency_stop(state: Extension<AppState>) -> String {
    state.printer.emergency_stop().await;
    "ok".to_string()
}

async fn restart_printer(state: Extension<AppState>) -> String {
    state.printer.restart().await;
    "ok".to_string()
}

async fn list_sd_files(state: Extension<AppState>) -> ServerResult<Json<Vec<SdFileEntry>>> {
    Ok(Json(state.store.list().await?))
}

async fn print_start(
    state: Extension<AppState>,
    Json(body): Json<api::StartPrint>,
) -> ServerResult<String> {
    state
        .job
        .start(body.filename)
        .await
        .map_err(|error| ServerError::bad_request(error.to_string()))?;
    Ok("ok".to_string())
}

async fn print_pause(state: Extension<AppState>) -> ServerResult<String> {
    state
        .job
        .pause()
        .await
        .map_err(|error| ServerError::bad_request(error.to_string()))?;
    Ok("ok".to_string())
}

async fn print_resume(state: Extension<AppState>) -> ServerResult<String> {
    state
        .job
        .resume()
        .await
        .map_err(|error| ServerError::bad_request(error.to_string()))?;
    Ok("ok".to_string())
}

async fn print_cancel(state: Extension<AppState>) -> ServerResult<String> {
    state
        .job
        .cancel()
        .await
        .map_err(|error| ServerError::bad_request(error.to_string()))?;
    Ok("ok".to_string())
}

/// Replay the console history, then stream live traffic.
async fn listen_console(ws: WebSocketUpgrade, state: Extension<AppState>) -> Response {
    let (history, mut live) = state.console.subscribe();
    send_stream(
        ws,
        stream! {
            for event in history {
                yield Message::Text(event.render());
            }
            loop {
                match live.recv().await {
                    Ok(event) => yield Message::Text(event.render()),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
        },
    )
}

static NEXT_CONNECTION_ID: AtomicUsize = AtomicUsize::new(1);

async fn rpc_websocket(ws: WebSocketUpgrade, state: Extension<AppState>) -> Response {
    let state = state.0.clone();
    ws.on_upgrade(move |socket| run_rpc_socket(socket, state))
}

async fn run_rpc_socket(socket: WebSocket, state: AppState) {
    let subscriber = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let (mut writer, mut reader) = socket.split();
    let (push, mut push_rx) = mpsc::channel::<Map<String, Value>>(32);
    loop {
        select! {
            status = push_rx.recv() => match status {
                None => break,
                Some(status) => {
                    let notification = RpcNotification::new(
                        "notify_status_update",
                        json!([status, eventtime()]),
                    );
                    match serde_json::to_string(&notification) {
                        Ok(text) => {
                            if writer.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => continue,
                    }
                }
            },
            incoming = reader.next() => match incoming {
                None | Some(Err(_)) => break,
                Some(Ok(Message::Close(_))) => break,
                Some(Ok(Message::Text(text))) => {
                    let reply = match serde_json::from_str::<RpcRequest>(&text) {
                        Ok(request) => dispatch_rpc(&state, subscriber, &push, request).await,
                        Err(error) => Some(RpcResponse::error(
                            None,
                            -32700,
                            format!("invalid request: {error}"),
                        )),
                    };
                    if let Some(reply) = reply {
                        if let Ok(text) = serde_json::to_string(&reply) {
                            if writer.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Some(Ok(_)) => {}
            },
        }
    }
    state.objects.unsubscribe(subscriber).await;
}

/// `{"objects": {"extruder": null, "toolhead": ["position"]}}` into the
/// model's request list; null means every topic.
fn parse_object_requests(params: &Value) -> Vec<(String, Option<Vec<String>>)> {
    params
        .get("objects")
        .and_then(Value::as_object)
        .map(|objects| {
            objects
                .iter()
                .map(|(name, topics)| {
                    let topics = topics.as_array().map(|list| {
                        list.iter()
                            .filter_map(|topic| topic.as_str().map(str::to_string))
                            .collect()
                    });
                    (name.clone(), topics)
                })
                .collect()
        })
        .unwrap_or_default()
}

async fn dispatch_rpc(
    state: &AppState,
    subscriber: usize,
    push: &mpsc::Sender<Map<String, Value>>,
    request: RpcRequest,
) -> Option<RpcResponse> {
    let id = request.id;
    let params = request.params.unwrap_or(Value::Null);
    let result: Result<Value, String> = match request.method.as_str() {
        "printer.objects.subscribe" => {
            let requests = parse_object_requests(&params);
            match state
                .objects
                .subscribe(subscriber, requests, push.clone())
                .await
            {
                Some(status) => Ok(json!({ "eventtime": eventtime(), "status": status })),
                None => Err("object model unavailable".to_string()),
            }
        }
        "printer.objects.query" => {
            match state.objects.query(parse_object_requests(&params)).await {
                Some(status) => Ok(json!({ "eventtime": eventtime(), "status": status })),
                None => Err("object model unavailable".to_string()),
            }
        }
        "printer.gcode.script" => {
            let script = params.get("script").and_then(Value::as_str).unwrap_or("");
            state
                .printer
                .run_script(script)
                .await
                .map(|()| json!("ok"))
                .map_err(|error| error.to_string())
        }
        "printer.print.start" => match params.get("filename").and_then(Value::as_str) {
            None => Err("filename required".to_string()),
            Some(filename) => state
                .job
                .start(filename.to_string())
                .await
                .map(|()| json!("ok"))
                .map_err(|error| error.to_string()),
        },
        "printer.print.pause" => state
            .job
            .pause()
            .await
            .map(|()| json!("ok"))
            .map_err(|error| error.to_string()),
        "printer.print.resume" => state
            .job
            .resume()
            .await
            .map(|()| json!("ok"))
            .map_err(|error| error.to_string()),
        "printer.print.cancel" => state
            .job
            .cancel()
            .await
            .map(|()| json!("ok"))
            .map_err(|error| error.to_string()),
        "printer.emergency_stop" => {
            state.printer.emergency_stop().await;
            Ok(json!("ok"))
        }
        "printer.restart" => {
            state.printer.restart().await;
            Ok(json!("ok"))
        }
        "printer.disconnect" => {
            state.printer.disconnect().await;
            Ok(json!("ok"))
        }
        "printer.reconnect" => {
            state.printer.reconnect().await;
            Ok(json!("ok"))
        }
        "printer.info" => {
            serde_json::to_value(state.printer.snapshot().info()).map_err(|error| error.to_string())
        }
        "server.info" => Ok(server_info_payload(state)),
        "server.connection.identify" => Ok(json!({ "connection_id": subscriber })),
        "server.files.list" => state
            .store
            .list()
            .await
            .map_err(|error| error.to_string())
            .and_then(|files| serde_json::to_value(files).map_err(|error| error.to_string())),
        other => {
            return id.map(|id| {
                RpcResponse::error(Some(id), -32601, format!("method {other:?} not found"))
            });
        }
    };
    // Methods invoked as notifications run but answer nothing.
    let id = id?;
    Some(match result {
        Ok(value) => RpcResponse::result(Some(id), value),
        Err(message) => RpcResponse::error(Some(id), 400, message),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_object_requests() {
        let params = json!({
            "objects": {
                "extruder": null,
                "toolhead": ["position", "homed_axes"],
            }
        });
        let mut requests = parse_object_requests(&params);
        requests.sort();
        assert_eq!(
            requests,
            vec![
                ("extruder".to_string(), None),
                (
                    "toolhead".to_string(),
                    Some(vec!["position".to_string(), "homed_axes".to_string()])
                ),
            ]
        );
        assert!(parse_object_requests(&Value::Null).is_empty());
    }
}
