//! Subscriber path: register with the hub, then keep a small control
//! protocol alive until the peer quits or its socket dies.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt as _};

use crate::ProxyState;
use crate::classify::SubscribeLine;
use crate::hub::SharedSink;
use crate::io::LineReader;

pub async fn handle<R, W>(sub: SubscribeLine, mut reader: LineReader<R>, writer: W, state: ProxyState) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let SubscribeLine { id, filter } = sub;

    let stop_signal = state.stop_signal.clone();

    let (token, sink) = state.hub.subscribe(id.clone(), Box::new(writer), filter).await;

    debug!(%id, "Subscriber registered");

    if write_control_line(&sink, format!("SUBSCRIBED {id}\n")).await.is_err() {
        state.hub.unsubscribe_token(&id, token).await;
        return Ok(());
    }

    loop {
        let line = tokio::select! {
            line = reader.next_line() => line,
            () = stop_signal.stopped() => break,
        };

        let Ok(Some(line)) = line else {
            // EOF, an oversized line or a socket error all end the
            // subscription the same way.
            break;
        };

        match line.as_ref() {
            b"PING" => {
                if write_control_line(&sink, "PONG\n".to_owned()).await.is_err() {
                    break;
                }
            }
            b"QUIT" => break,
            _ => {}
        }
    }

    debug!(%id, "Subscriber gone");

    state.hub.unsubscribe_token(&id, token).await;

    Ok(())
}

async fn write_control_line(sink: &SharedSink, line: String) -> std::io::Result<()> {
    let mut sink = sink.lock().await;
    sink.write_all(line.as_bytes()).await?;
    sink.flush().await
}
