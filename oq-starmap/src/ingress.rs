//! The dispatcher's single inbound result stream.
//!
//! Inline and thread-pool workers push replies straight into the channel;
//! pool children and remote workers connect to the advertised address and
//! their frames are forwarded onto the same channel. There is no ordering
//! across tasks, only within one task's connection.

use anyhow::Context;
use oq_messages::wire::read_frame_async;
use oq_messages::ReplyEnvelope;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::runner::ReplySender;

pub struct Ingress {
    /// Address workers push replies to, `ip:port`.
    pub backurl: String,

    tx: ReplySender,
    rx: mpsc::UnboundedReceiver<ReplyEnvelope>,
    acceptor: JoinHandle<()>,
}

impl Ingress {
    /// Binds the first free port of `ports` and starts accepting reply
    /// connections. `return_ip` is the address advertised to workers, not
    /// necessarily the bind address.
    pub async fn bind(
        return_ip: &str,
        ports: (u16, u16),
    ) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listener = None;
        for port in ports.0..=ports.1 {
            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(bound) => {
                    listener = Some((bound, port));
                    break;
                },
                Err(_) => continue,
            }
        }
        let (listener, port) = listener
            .with_context(|| format!("no free ingress port in {}-{}", ports.0, ports.1))?;
        let backurl = format!("{return_ip}:{port}");
        debug!("Ingress bound. backurl: {}", backurl);

        let forward = tx.clone();
        let acceptor = tokio::spawn(async move {
            loop {
                let Ok((mut conn, peer)) = listener.accept().await else {
                    break;
                };
                debug!("Ingress connection accepted. peer: {}", peer);
                let forward = forward.clone();
                tokio::spawn(async move {
                    loop {
                        match read_frame_async::<ReplyEnvelope>(&mut conn).await {
                            Ok(Some(reply)) => {
                                if forward.send(reply).is_err() {
                                    break;
                                }
                            },
                            Ok(None) => break,
                            Err(err) => {
                                debug!("Ingress connection dropped. err: {:?}", err);
                                break;
                            },
                        }
                    }
                });
            }
        });

        Ok(Self {
            backurl,
            tx,
            rx,
            acceptor,
        })
    }

    /// A sender for workers living in this process.
    pub fn sender(&self) -> ReplySender {
        self.tx.clone()
    }

    /// The next reply, in arrival order across all workers.
    pub async fn recv(&mut self) -> Option<ReplyEnvelope> {
        self.rx.recv().await
    }

    pub fn close(self) {
        self.acceptor.abort();
    }
}

#[cfg(test)]
mod tests {
    use oq_messages::wire::write_frame_async;
    use oq_messages::Monitor;
    use oq_messages::Packed;
    use oq_messages::Reply;
    use oq_messages::ReplyEnvelope;
    use tokio::net::TcpStream;

    use super::Ingress;

    #[tokio::test]
    async fn local_and_remote_replies_share_the_stream() -> anyhow::Result<()> {
        let mut ingress = Ingress::bind("127.0.0.1", (19907, 19927)).await?;

        // local push
        let local = ReplyEnvelope::new(
            Reply::Value(Packed::new(&1u32)?),
            Monitor::new("total count"),
        );
        ingress.sender().send(local)?;

        // remote push over a real connection
        let mut conn = TcpStream::connect(&ingress.backurl).await?;
        let remote = ReplyEnvelope::new(
            Reply::Value(Packed::new(&2u32)?),
            Monitor::new("total count"),
        );
        write_frame_async(&mut conn, &remote).await?;

        let mut values = Vec::new();
        for _ in 0..2 {
            let reply = ingress.recv().await.expect("reply lost");
            let Reply::Value(packed) = reply.body else {
                anyhow::bail!("unexpected reply kind");
            };
            values.push(packed.unpack::<u32>()?);
        }
        values.sort_unstable();
        assert_eq!(values, vec![1, 2]);
        Ok(())
    }
}
