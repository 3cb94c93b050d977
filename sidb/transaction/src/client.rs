//! Per-process access to the timestamp authority.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender, bounded, unbounded};
use tracing::{debug, warn};

use crate::error::{TimestampError, TimestampResult};
use crate::timestamp::{Timestamp, TimestampAuthority};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// The source of timestamps every transactional component depends on.
pub trait TimestampSource: Send + Sync {
    /// A timestamp strictly greater than every timestamp issued before it.
    fn next_timestamp(&self) -> TimestampResult<Timestamp>;

    /// Persist a low watermark that survives a restart of the authority.
    fn remember_timestamp(&self, ts: Timestamp) -> TimestampResult<()>;

    /// The last persisted watermark.
    fn retrieve_timestamp(&self) -> TimestampResult<Timestamp>;
}

/// One outbound connection to the authority. Calls may block for as long as the
/// authority takes to answer.
pub trait TimestampTransport: Send + Sync {
    fn request_next(&self) -> TimestampResult<Timestamp>;

    fn remember(&self, ts: Timestamp) -> TimestampResult<()>;

    fn retrieve(&self) -> TimestampResult<Timestamp>;
}

/// Transport to an authority living in the same process.
pub struct LocalTransport {
    authority: Arc<TimestampAuthority>,
}

impl LocalTransport {
    pub fn new(authority: Arc<TimestampAuthority>) -> Self {
        Self { authority }
    }
}

impl TimestampTransport for LocalTransport {
    fn request_next(&self) -> TimestampResult<Timestamp> {
        self.authority.next()
    }

    fn remember(&self, ts: Timestamp) -> TimestampResult<()> {
        self.authority.remember(ts)
    }

    fn retrieve(&self) -> TimestampResult<Timestamp> {
        self.authority.retrieve()
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upper bound on a single round trip to the authority, including the wait for the
    /// shared connection.
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

type Request = Box<dyn FnOnce(&dyn TimestampTransport) + Send>;

/// Shared client over a single transport.
///
/// Requests are queued to one connection thread that owns the transport, so callers
/// serialize on the transport only. A caller waits for its answer until `request_timeout`
/// has passed and then fails with [`TimestampError::Unavailable`]; the late answer, if
/// any, is dropped, leaving a harmless gap in the sequence. Requests still queued past
/// their deadline are never sent. Retrying is up to the caller.
pub struct TimestampSourceClient {
    requests: Sender<Request>,
    config: ClientConfig,
}

impl TimestampSourceClient {
    /// Start the connection thread for `transport`. It exits once the client is dropped
    /// and its current request, if any, returns.
    pub fn new(
        transport: Box<dyn TimestampTransport>,
        config: ClientConfig,
    ) -> TimestampResult<Self> {
        let (requests, queue) = unbounded::<Request>();
        thread::Builder::new()
            .name("sidb-timestamp-client".to_string())
            .spawn(move || {
                for request in queue {
                    request(transport.as_ref());
                }
                debug!("timestamp connection closed");
            })
            .map_err(|e| TimestampError::Unavailable(format!("cannot start connection: {e}")))?;
        Ok(Self { requests, config })
    }

    pub fn local(
        authority: Arc<TimestampAuthority>,
        config: ClientConfig,
    ) -> TimestampResult<Self> {
        Self::new(Box::new(LocalTransport::new(authority)), config)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn call<T, F>(&self, op: &'static str, request: F) -> TimestampResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn TimestampTransport) -> TimestampResult<T> + Send + 'static,
    {
        let timeout = self.config.request_timeout;
        let deadline = Instant::now() + timeout;
        let (reply, answer) = bounded(1);
        let queued: Request = Box::new(move |transport: &dyn TimestampTransport| {
            if Instant::now() >= deadline {
                return;
            }
            // The caller may have given up in the meantime.
            let _ = reply.send(request(transport));
        });
        self.requests
            .send(queued)
            .map_err(|_| TimestampError::Unavailable(format!("{op}: connection closed")))?;

        let result = match answer.recv_deadline(deadline) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {
                warn!(op, ?timeout, "no timestamp answer in time");
                return Err(TimestampError::Unavailable(format!(
                    "{op}: no answer within {timeout:?}"
                )));
            }
        };
        result.map_err(|e| match e {
            TimestampError::Overflow(_) => e,
            other => {
                warn!(op, error = %other, "timestamp request failed");
                TimestampError::Unavailable(format!("{op}: {other}"))
            }
        })
    }
}

impl TimestampSource for TimestampSourceClient {
    fn next_timestamp(&self) -> TimestampResult<Timestamp> {
        let ts = self.call("next_timestamp", |t| t.request_next())?;
        debug!(ts = ts.raw(), "got new timestamp");
        Ok(ts)
    }

    fn remember_timestamp(&self, ts: Timestamp) -> TimestampResult<()> {
        self.call("remember_timestamp", move |t| t.remember(ts))
    }

    fn retrieve_timestamp(&self) -> TimestampResult<Timestamp> {
        self.call("retrieve_timestamp", |t| t.retrieve())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::timestamp::AuthorityConfig;
    use crate::watermark::MemoryWatermarkStore;

    fn local_client(config: ClientConfig) -> TimestampSourceClient {
        let authority = TimestampAuthority::recover(
            Arc::new(MemoryWatermarkStore::default()),
            &AuthorityConfig::default(),
        )
        .unwrap();
        TimestampSourceClient::local(Arc::new(authority), config).unwrap()
    }

    struct SlowTransport {
        delay: Duration,
    }

    impl TimestampTransport for SlowTransport {
        fn request_next(&self) -> TimestampResult<Timestamp> {
            thread::sleep(self.delay);
            Ok(Timestamp::with_ts(1))
        }

        fn remember(&self, _ts: Timestamp) -> TimestampResult<()> {
            Ok(())
        }

        fn retrieve(&self) -> TimestampResult<Timestamp> {
            Ok(Timestamp::ZERO)
        }
    }

    struct BrokenTransport;

    impl TimestampTransport for BrokenTransport {
        fn request_next(&self) -> TimestampResult<Timestamp> {
            Err(TimestampError::WatermarkWrite("connection reset".to_string()))
        }

        fn remember(&self, _ts: Timestamp) -> TimestampResult<()> {
            Ok(())
        }

        fn retrieve(&self) -> TimestampResult<Timestamp> {
            Ok(Timestamp::ZERO)
        }
    }

    #[test]
    fn test_local_client_issues_increasing_timestamps() {
        let client = local_client(ClientConfig::default());
        let ts1 = client.next_timestamp().unwrap();
        let ts2 = client.next_timestamp().unwrap();
        assert!(ts2 > ts1);

        client.remember_timestamp(Timestamp::with_ts(100)).unwrap();
        assert!(client.retrieve_timestamp().unwrap().raw() >= 100);
        assert!(client.next_timestamp().unwrap().raw() > 100);
    }

    #[test]
    fn test_hung_authority_times_out_on_time() {
        let timeout = Duration::from_millis(50);
        let client = TimestampSourceClient::new(
            Box::new(SlowTransport {
                delay: Duration::from_secs(3),
            }),
            ClientConfig {
                request_timeout: timeout,
            },
        )
        .unwrap();

        let started = Instant::now();
        assert!(matches!(
            client.next_timestamp(),
            Err(TimestampError::Unavailable(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(1));

        // Queued behind the hung request, the next caller is bounded the same way.
        let started = Instant::now();
        assert!(matches!(
            client.next_timestamp(),
            Err(TimestampError::Unavailable(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_answer_within_timeout_is_kept() {
        let client = TimestampSourceClient::new(
            Box::new(SlowTransport {
                delay: Duration::from_millis(10),
            }),
            ClientConfig {
                request_timeout: Duration::from_secs(5),
            },
        )
        .unwrap();
        assert_eq!(client.next_timestamp().unwrap(), Timestamp::with_ts(1));
    }

    #[test]
    fn test_transport_failure_surfaces_without_retry() {
        let client =
            TimestampSourceClient::new(Box::new(BrokenTransport), ClientConfig::default())
                .unwrap();
        assert!(matches!(
            client.next_timestamp(),
            Err(TimestampError::Unavailable(_))
        ));
    }

    #[test]
    fn test_shared_client_across_threads() {
        let client = Arc::new(local_client(ClientConfig::default()));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let client = client.clone();
                thread::spawn(move || {
                    (0..100)
                        .map(|_| client.next_timestamp().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all: Vec<_> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 400);
    }
}
