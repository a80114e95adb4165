//! The remote backend: envelopes travel to long-running workers over one
//! lazy connection per host, replies come back on the ingress.

use std::collections::HashMap;

use oq_messages::wire::write_frame_async;
use oq_messages::wire::Downstream;
use oq_messages::Envelope;
use tokio::net::TcpStream;
use tracing::debug;

use crate::errors::DispatchError;

pub struct RemoteConns {
    hosts: Vec<String>,
    next: usize,
    conns: HashMap<String, TcpStream>,
}

impl RemoteConns {
    pub fn new(hosts: Vec<String>) -> Result<Self, DispatchError> {
        if hosts.is_empty() {
            return Err(DispatchError::BackendUnavailable {
                backend: "remote",
                reason: "no worker hosts configured".to_owned(),
            });
        }
        Ok(Self {
            hosts,
            next: 0,
            conns: HashMap::new(),
        })
    }

    /// Sends one envelope. A monitor with a pinned host goes there; the
    /// rest cycle round-robin through the configured hosts.
    pub async fn submit(
        &mut self,
        envelope: Envelope,
    ) -> anyhow::Result<()> {
        let host = match &envelope.monitor.host {
            Some(host) => {
                debug!("Sending task {} to {}", envelope.task_no, host);
                host.clone()
            },
            None => self.next_host(),
        };
        if !self.conns.contains_key(&host) {
            // one connection per host, kept open for the life of the job
            let conn = TcpStream::connect(&host).await.map_err(|err| {
                DispatchError::BackendUnavailable {
                    backend: "remote",
                    reason: format!("cannot reach {host}: {err}"),
                }
            })?;
            self.conns.insert(host.clone(), conn);
        }
        let conn = self.conns.get_mut(&host).expect("inserted above");
        write_frame_async(conn, &Downstream::Todo { envelope }).await?;
        Ok(())
    }

    /// Tells every connected worker the job is over.
    pub async fn close(&mut self) {
        for conn in self.conns.values_mut() {
            let _ = write_frame_async(conn, &Downstream::Stop).await;
        }
        self.conns.clear();
    }

    fn next_host(&mut self) -> String {
        let host = self.hosts[self.next % self.hosts.len()].clone();
        self.next += 1;
        host
    }
}
