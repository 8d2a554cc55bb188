use axum::{
    extract::ws::{Message, WebSocketUpgrade},
    response::Response,
};
use futures::{pin_mut, SinkExt, Stream, StreamExt};
use tokio::{join, select, sync::oneshot};

/// Upgrade to a websocket that only pushes. The read half is drained
/// anyway so close frames from the client actually end the stream.
pub fn send_stream<T: Stream<Item = Message> + Send + 'static>(
    ws: WebSocketUpgrade,
    stream: T,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let (mut writer, mut reader) = socket.split();
        let (closer, mut close_listen) = oneshot::channel::<()>();
        let (writer, reader) = join! {
            async move {
                pin_mut!(stream);
                let mut next_message = stream.next();
                loop {
                    select! {
                        message = &mut next_message => {
                            match message {
                                Some(message) => {
                                    if writer.send(message).await.is_err() {
                                        break;
                                    }
                                    next_message = stream.next();
                                }
                                None => break,
                            }
                        }
                        _ = &mut close_listen => break,
                    }
                }
                writer
            },
            async move {
                loop {
                    let response = reader.next().await;
                    if let Some(Ok(Message::Close(_))) = response {
                        drop(closer.send(()));
                        break;
                    }
                    if response.is_none() {
                        break;
                    }
                }
                reader
            }
        };
        if let Ok(together) = reader.reunite(writer) {
            drop(together.close().await);
        }
    })
}
