//! Framed RPC client for the master.
//!
//! One connection, one request/reply in flight at a time; callers that share
//! a client (the compute loop and the heartbeat) serialise access behind an
//! async mutex.

use std::net::{IpAddr, SocketAddr};

use thiserror::Error;
use tokio::net::TcpStream;

use swarmpi_proto::{JobAssignment, Reply, Request, WireError, read_message, write_message};

/// RPC failures. Any of these invalidates the connection; the caller's
/// recovery is always the same reconnect path.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport or framing failure.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The master answered a different verb than was asked.
    #[error("unexpected reply to {verb}")]
    UnexpectedReply {
        /// The verb that was sent.
        verb: &'static str,
    },
}

/// A connected master client.
pub struct MasterClient {
    stream: TcpStream,
}

impl MasterClient {
    /// Dial the master once. Retry policy belongs to the caller.
    pub async fn dial(addr: SocketAddr) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// The local address of this connection, which is the IPv4 the master
    /// should know this worker by.
    pub fn local_ip(&self) -> Option<IpAddr> {
        self.stream.local_addr().ok().map(|addr| addr.ip())
    }

    async fn call(&mut self, request: &Request) -> Result<Reply, ClientError> {
        write_message(&mut self.stream, request).await?;
        Ok(read_message(&mut self.stream).await?)
    }

    /// Register with the master; returns the assigned worker name.
    pub async fn connect(&mut self) -> Result<String, ClientError> {
        let worker_ip = self
            .local_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_default();
        match self.call(&Request::Connect { worker_ip }).await? {
            Reply::Connect { worker_name } => Ok(worker_name),
            _ => Err(ClientError::UnexpectedReply { verb: "Connect" }),
        }
    }

    /// Ask for the next term range.
    pub async fn ask(&mut self, worker_name: &str) -> Result<JobAssignment, ClientError> {
        let request = Request::Ask {
            worker_name: worker_name.to_string(),
        };
        match self.call(&request).await? {
            Reply::Ask(assignment) => Ok(assignment),
            _ => Err(ClientError::UnexpectedReply { verb: "Ask" }),
        }
    }

    /// Return a computed partial sum.
    pub async fn give(
        &mut self,
        job_id: u64,
        result: Vec<u8>,
        precision: u32,
    ) -> Result<(), ClientError> {
        let request = Request::Give {
            job_id,
            result,
            precision,
        };
        match self.call(&request).await? {
            Reply::Give => Ok(()),
            _ => Err(ClientError::UnexpectedReply { verb: "Give" }),
        }
    }

    /// Heartbeat.
    pub async fn ping(&mut self, worker_name: &str) -> Result<(), ClientError> {
        let request = Request::Ping {
            worker_name: worker_name.to_string(),
        };
        match self.call(&request).await? {
            Reply::Ping => Ok(()),
            _ => Err(ClientError::UnexpectedReply { verb: "Ping" }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accepts one connection and answers each verb in kind.
    async fn fake_master(listener: TcpListener) {
        let (mut stream, _) = listener.accept().await.unwrap();
        loop {
            let request: Request = match read_message(&mut stream).await {
                Ok(request) => request,
                Err(_) => return,
            };
            let reply = match request {
                Request::Connect { worker_ip } => {
                    assert!(!worker_ip.is_empty());
                    Reply::Connect {
                        worker_name: "testWrkr".to_string(),
                    }
                }
                Request::Ask { worker_name } => {
                    assert_eq!(worker_name, "testWrkr");
                    Reply::Ask(JobAssignment {
                        job_id: 3,
                        first_term: 30,
                        num_terms: 10,
                    })
                }
                Request::Give { job_id, .. } => {
                    assert_eq!(job_id, 3);
                    Reply::Give
                }
                Request::Ping { .. } => Reply::Ping,
            };
            write_message(&mut stream, &reply).await.unwrap();
        }
    }

    #[tokio::test]
    async fn verbs_roundtrip_against_a_fake_master() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(fake_master(listener));

        let mut client = MasterClient::dial(addr).await.unwrap();
        let name = client.connect().await.unwrap();
        assert_eq!(name, "testWrkr");

        let assignment = client.ask(&name).await.unwrap();
        assert_eq!(assignment.job_id, 3);
        assert_eq!(assignment.first_term, 30);
        assert!(!assignment.is_empty());

        client.give(3, vec![1, 2, 3], 64).await.unwrap();
        client.ping(&name).await.unwrap();

        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn dialing_a_dead_port_fails() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(MasterClient::dial(addr).await.is_err());
    }
}
