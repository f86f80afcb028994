use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::task::Context;

use bytes::Bytes;
use dashmap::DashMap;
use fedsql_error::DbError;
use tracing::trace;

use super::future::{ResultSender, send_result};
use crate::request::message::LobChunk;
use crate::request::request_id::RequestId;
use crate::runtime::work_item::{Work, WorkItem};

pub(crate) type LobKey = (RequestId, String);

/// Open large object streams, by request and lob id.
pub(crate) type LobStreams = DashMap<LobKey, Arc<WorkItem<LobWork>>>;

/// Streams a large object to a client one chunk per request.
///
/// Runs as its own work item so that large values never hold up the request
/// that produced them.
#[derive(Debug)]
pub(crate) struct LobWork {
    data: Bytes,
    chunk_size: usize,
    offset: usize,
    /// Set once the last chunk has been sent.
    finished: bool,
    pending: VecDeque<ResultSender<LobChunk>>,
    /// Table to remove ourselves from once the last chunk is sent.
    registration: Option<(Weak<LobStreams>, LobKey)>,
}

impl LobWork {
    pub(crate) fn new(data: Bytes, chunk_size: usize) -> Self {
        LobWork {
            data,
            chunk_size: chunk_size.max(1),
            offset: 0,
            finished: false,
            pending: VecDeque::new(),
            registration: None,
        }
    }

    pub(crate) fn with_registration(mut self, streams: Weak<LobStreams>, key: LobKey) -> Self {
        self.registration = Some((streams, key));
        self
    }

    fn unregister(&mut self) {
        if let Some((streams, key)) = self.registration.take() {
            if let Some(streams) = streams.upgrade() {
                streams.remove(&key);
            }
            trace!(request = %key.0, lob = %key.1, "lob stream finished");
        }
    }

    /// Queue a request for the next chunk.
    ///
    /// Hands the sender back if the stream has already sent its last chunk.
    pub(crate) fn enqueue(
        &mut self,
        sender: ResultSender<LobChunk>,
    ) -> Result<(), ResultSender<LobChunk>> {
        if self.finished {
            return Err(sender);
        }
        self.pending.push_back(sender);
        Ok(())
    }

    fn next_chunk(&mut self) -> LobChunk {
        let end = (self.offset + self.chunk_size).min(self.data.len());
        let data = self.data.slice(self.offset..end);
        self.offset = end;
        let last = self.offset >= self.data.len();
        LobChunk { data, last }
    }
}

impl Work for LobWork {
    fn process(&mut self, _cx: &mut Context<'_>) {
        while let Some(sender) = self.pending.pop_front() {
            if self.finished {
                send_result(sender, Err(DbError::new("Large object stream already complete")));
                continue;
            }
            let chunk = self.next_chunk();
            self.finished = chunk.last;
            trace!(offset = self.offset, last = chunk.last, "sending lob chunk");
            send_result(sender, Ok(chunk));
        }

        if self.finished {
            self.unregister();
        }
    }

    fn is_done_processing(&self) -> bool {
        self.finished && self.pending.is_empty()
    }
}
