//! Session manager
//!
//! Owns the table of live sessions. Every mutating operation on a session
//! runs under that session's mutex, so the offset check, the store append and
//! the completion hand-off are one step for concurrent requests.
//!
//! # Completion
//!
//! When an upload becomes complete the manager hands it to the
//! [`CompletionDispatcher`] while still holding the session lock. The outcome
//! is recorded on the session, which makes dispatch happen exactly once no
//! matter how many requests observe the final offset.

use super::{
    CompletionState, ConcatRole, NewSession, SessionError, SessionPolicy, SessionStatus,
    UploadId, UploadSession,
};
use crate::completion::{CompletedUpload, CompletionDispatcher, CompletionRecord, DispatchError};
use crate::metrics;
use crate::store::{ChunkStore, EntryReader, StoreError};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard};

type SessionHandle = Arc<Mutex<UploadSession>>;

/// Coordinates sessions, the chunk store and completion dispatch
pub struct SessionManager {
    sessions: DashMap<UploadId, SessionHandle>,
    store: Arc<dyn ChunkStore>,
    dispatcher: Arc<dyn CompletionDispatcher>,
    policy: SessionPolicy,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        dispatcher: Arc<dyn CompletionDispatcher>,
        policy: SessionPolicy,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            store,
            dispatcher,
            policy,
        }
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    /// Number of sessions currently tracked
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Start a new upload.
    ///
    /// A final upload whose partial uploads are already complete is merged
    /// right away; a zero-length upload completes immediately.
    #[tracing::instrument(
        name = "session.create",
        skip(self, new),
        fields(upload.length = ?new.declared_length, upload_id = tracing::field::Empty),
        err
    )]
    pub async fn create(&self, new: NewSession) -> Result<SessionStatus, SessionError> {
        self.policy.validate(&new.metadata, &new.concat)?;

        if let (Some(length), Some(max)) = (new.declared_length, self.policy.max_size) {
            if length > max {
                return Err(SessionError::TooLarge { size: length, max });
            }
        }

        if let ConcatRole::Final(parts) = &new.concat {
            self.check_final_parts(parts, new.declared_length).await?;
        }

        let id = UploadId::generate();
        self.timed(self.store.create_entry(&id)).await?;

        let now = Utc::now();
        let session = UploadSession {
            id: id.clone(),
            declared_length: new.declared_length,
            bytes_received: 0,
            metadata: new.metadata,
            concat: new.concat,
            owner: new.owner,
            created_at: now,
            last_activity: now,
            expires_at: self.expiry_from(now),
            completion: CompletionState::Pending,
            offset_unsettled: false,
        };

        if let Err(e) = self.persist(&session).await {
            if let Err(cleanup) = self.store.delete(&id).await {
                tracing::warn!(upload_id = %id, error = %cleanup, "Failed to remove orphaned entry");
            }
            return Err(e.into());
        }

        let role = concat_label(&session.concat);
        let handle = Arc::new(Mutex::new(session));
        // Lock before publishing so nobody observes the session mid-setup
        let mut session = Arc::clone(&handle).lock_owned().await;
        self.sessions.insert(id.clone(), handle);

        tracing::Span::current().record("upload_id", id.as_str());
        metrics::record_session_created(role);
        metrics::set_active_sessions(self.sessions.len());
        tracing::info!(upload_id = %id, role, "Upload created");

        if session.concat.is_final() {
            match self.merge_locked(&mut session).await {
                Ok(()) => self.complete_locked(&mut session).await,
                Err(SessionError::IncompleteDependency(part)) => {
                    tracing::debug!(upload_id = %id, part = %part, "Merge deferred until finalize");
                }
                Err(e) => {
                    tracing::warn!(upload_id = %id, error = %e, "Merge on create failed");
                }
            }
        } else if session.is_complete() {
            self.complete_locked(&mut session).await;
        }

        Ok(session.status())
    }

    /// Current state of an upload
    pub async fn status(&self, id: &UploadId) -> Result<SessionStatus, SessionError> {
        let mut session = self.lock_live(id).await?;
        self.settle_offset(&mut session).await;
        Ok(session.status())
    }

    /// Append one chunk at `offset`, returning the new offset
    pub async fn advance(
        &self,
        id: &UploadId,
        offset: u64,
        chunk: Bytes,
    ) -> Result<u64, SessionError> {
        let body = futures::stream::once(async move { Ok::<_, std::io::Error>(chunk) });
        self.advance_stream(id, offset, None, body).await
    }

    /// Append a streamed request body at `offset`.
    ///
    /// `upload_length` sets a deferred length before the bytes are taken.
    /// Bytes are written in buffers of `write_buffer_size`; when the stream
    /// breaks, everything received up to that point is kept and
    /// [`SessionError::Interrupted`] is returned.
    #[tracing::instrument(
        name = "session.advance",
        skip(self, body),
        fields(upload_id = %id, upload.offset = offset),
        err
    )]
    pub async fn advance_stream<S, E>(
        &self,
        id: &UploadId,
        offset: u64,
        upload_length: Option<u64>,
        body: S,
    ) -> Result<u64, SessionError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: std::fmt::Display + Send,
    {
        let mut session = self.lock_live(id).await?;

        if session.concat.is_final() {
            return Err(SessionError::Forbidden(
                "final uploads are assembled from partial uploads and cannot be appended to".into(),
            ));
        }

        if let Some(length) = upload_length {
            self.set_deferred_length(&mut session, length).await?;
        }

        self.settle_offset(&mut session).await;
        if session.bytes_received != offset {
            metrics::record_offset_mismatch();
            return Err(SessionError::OffsetMismatch {
                expected: offset,
                actual: session.bytes_received,
            });
        }

        let mut body = std::pin::pin!(body);
        let mut buffer = BytesMut::new();
        let mut outcome = Ok(());

        while let Some(frame) = body.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    outcome = Err(SessionError::Interrupted(e.to_string()));
                    break;
                }
            };

            let attempted = session.bytes_received + (buffer.len() + frame.len()) as u64;
            if let Some(declared) = session.declared_length {
                if attempted > declared {
                    outcome = Err(SessionError::ExceedsLength {
                        declared,
                        attempted,
                    });
                    break;
                }
            } else if let Some(max) = self.policy.max_size {
                if attempted > max {
                    outcome = Err(SessionError::TooLarge {
                        size: attempted,
                        max,
                    });
                    break;
                }
            }

            buffer.extend_from_slice(&frame);
            if buffer.len() >= self.policy.write_buffer_size {
                self.write_buffered(&mut session, buffer.split().freeze())
                    .await?;
            }
        }

        if !buffer.is_empty() {
            self.write_buffered(&mut session, buffer.freeze()).await?;
        }

        self.touch(&mut session);
        self.persist_quietly(&session).await;
        outcome?;

        if session.is_complete() {
            self.complete_locked(&mut session).await;
        }

        Ok(session.bytes_received)
    }

    /// Run completion for an upload whose bytes are all in.
    ///
    /// Calling this again after completion is a no-op.
    pub async fn mark_complete(&self, id: &UploadId) -> Result<SessionStatus, SessionError> {
        let mut session = self.lock_live(id).await?;
        if !session.is_complete() {
            return Err(SessionError::Validation(format!(
                "upload {} has {} of {:?} bytes",
                id, session.bytes_received, session.declared_length
            )));
        }
        self.complete_locked(&mut session).await;
        Ok(session.status())
    }

    /// Merge the partial uploads of a final upload and return the merged bytes.
    ///
    /// Fails with [`SessionError::IncompleteDependency`] while any partial
    /// upload is still missing bytes.
    #[tracing::instrument(name = "session.concatenate", skip(self), fields(upload_id = %id), err)]
    pub async fn concatenate(&self, id: &UploadId) -> Result<EntryReader, SessionError> {
        let mut session = self.lock_live(id).await?;
        if !session.concat.is_final() {
            return Err(SessionError::InvalidConcat(format!(
                "{} is not a final upload",
                id
            )));
        }
        if matches!(session.completion, CompletionState::Dispatched { .. }) {
            return Err(SessionError::Forbidden(format!(
                "{} has already been handed off",
                id
            )));
        }

        if !session.is_complete() {
            self.merge_locked(&mut session).await?;
        }
        let reader = self.timed(self.store.read(id)).await?;
        self.complete_locked(&mut session).await;
        Ok(reader)
    }

    /// Merge a final upload if it is not merged yet. Idempotent.
    #[tracing::instrument(name = "session.finalize", skip(self), fields(upload_id = %id), err)]
    pub async fn finalize(&self, id: &UploadId) -> Result<SessionStatus, SessionError> {
        let mut session = self.lock_live(id).await?;
        if !session.concat.is_final() {
            return Err(SessionError::InvalidConcat(format!(
                "{} is not a final upload",
                id
            )));
        }

        if !session.is_complete() {
            self.merge_locked(&mut session).await?;
        }
        self.complete_locked(&mut session).await;
        Ok(session.status())
    }

    /// Abort an upload and discard its bytes
    #[tracing::instrument(name = "session.terminate", skip(self), fields(upload_id = %id), err)]
    pub async fn terminate(&self, id: &UploadId) -> Result<(), SessionError> {
        let (_, handle) = self
            .sessions
            .remove(id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;

        // Wait for an in-flight append to settle before deleting
        let _session = handle.lock().await;
        self.timed(self.store.delete(id)).await?;

        metrics::record_terminated();
        metrics::set_active_sessions(self.sessions.len());
        tracing::info!(upload_id = %id, "Upload terminated");
        Ok(())
    }

    /// Re-run a completion that failed earlier
    pub async fn retry_completion(&self, id: &UploadId) -> Result<SessionStatus, SessionError> {
        let mut session = self.lock_live(id).await?;
        if let CompletionState::Failed { reason } = &session.completion {
            tracing::info!(upload_id = %id, previous = %reason, "Retrying completion");
            session.completion = CompletionState::Pending;
        }
        self.complete_locked(&mut session).await;
        Ok(session.status())
    }

    /// Drop every session idle past its expiry, returning how many went.
    ///
    /// Sessions whose completion failed are kept for reconciliation. Busy
    /// sessions are skipped and picked up on a later sweep.
    pub async fn expire_idle(&self, now: DateTime<Utc>) -> usize {
        let candidates: Vec<UploadId> = self
            .sessions
            .iter()
            .filter_map(|entry| {
                let session = entry.value().try_lock().ok()?;
                expirable(&session, now).then(|| entry.key().clone())
            })
            .collect();

        let mut expired = 0;
        for id in candidates {
            let removed = self.sessions.remove_if(&id, |_, handle| {
                handle
                    .try_lock()
                    .map(|session| expirable(&session, now))
                    .unwrap_or(false)
            });
            if removed.is_none() {
                continue;
            }

            if let Err(e) = self.timed(self.store.delete(&id)).await {
                tracing::warn!(upload_id = %id, error = %e, "Failed to delete expired entry");
            }
            expired += 1;
        }

        if expired > 0 {
            metrics::record_sessions_expired(expired);
            metrics::set_active_sessions(self.sessions.len());
            tracing::info!(count = expired, "Expired idle uploads");
        }
        expired
    }

    /// Rebuild the session table from snapshots left in the store.
    ///
    /// The stored entry length wins over the snapshot's byte count. Uploads
    /// that were complete but never dispatched are dispatched now.
    #[tracing::instrument(name = "session.recover", skip(self), err)]
    pub async fn recover(&self) -> Result<usize, SessionError> {
        let infos = self.timed(self.store.list_infos()).await?;
        let now = Utc::now();
        let mut recovered = 0;

        for (id, raw) in infos {
            let mut session: UploadSession = match serde_json::from_slice(&raw) {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!(upload_id = %id, error = %e, "Skipping unreadable session snapshot");
                    continue;
                }
            };
            if session.id != id {
                tracing::warn!(upload_id = %id, "Skipping snapshot stored under another id");
                continue;
            }

            if expirable(&session, now) {
                self.timed(self.store.delete(&id)).await?;
                continue;
            }

            match self.timed(self.store.length(&id)).await {
                Ok(length) => session.bytes_received = length,
                Err(StoreError::NotFound(_)) => {
                    self.timed(self.store.delete(&id)).await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            let needs_completion =
                session.is_complete() && session.completion == CompletionState::Pending;
            let handle = Arc::new(Mutex::new(session));
            self.sessions.insert(id.clone(), Arc::clone(&handle));
            recovered += 1;

            if needs_completion {
                let mut session = handle.lock_owned().await;
                self.complete_locked(&mut session).await;
            }
        }

        metrics::set_active_sessions(self.sessions.len());
        tracing::info!(count = recovered, "Recovered uploads from store");
        Ok(recovered)
    }

    async fn check_final_parts(
        &self,
        parts: &[UploadId],
        declared_length: Option<u64>,
    ) -> Result<(), SessionError> {
        if declared_length.is_some() {
            return Err(SessionError::InvalidConcat(
                "final upload must not declare Upload-Length".into(),
            ));
        }
        if parts.is_empty() {
            return Err(SessionError::InvalidConcat(
                "final upload lists no partial uploads".into(),
            ));
        }

        for (idx, part) in parts.iter().enumerate() {
            if parts[..idx].contains(part) {
                return Err(SessionError::InvalidConcat(format!(
                    "partial upload {} listed twice",
                    part
                )));
            }
            let session = self.lock_live(part).await.map_err(|_| {
                SessionError::InvalidConcat(format!("unknown partial upload {}", part))
            })?;
            if !session.concat.is_partial() {
                return Err(SessionError::InvalidConcat(format!(
                    "{} is not a partial upload",
                    part
                )));
            }
        }

        Ok(())
    }

    /// Merge the parts of a locked final session into its store entry
    async fn merge_locked(&self, session: &mut UploadSession) -> Result<(), SessionError> {
        let ConcatRole::Final(parts) = session.concat.clone() else {
            return Err(SessionError::InvalidConcat(format!(
                "{} is not a final upload",
                session.id
            )));
        };

        // Lock parts in id order so overlapping merges cannot deadlock
        let mut lock_order = parts.clone();
        lock_order.sort_by(|a, b| a.as_str().cmp(b.as_str()));

        let mut guards = Vec::with_capacity(lock_order.len());
        for part in &lock_order {
            let guard = self.lock_live(part).await.map_err(|_| {
                SessionError::InvalidConcat(format!("partial upload {} no longer exists", part))
            })?;
            if !guard.is_complete() {
                return Err(SessionError::IncompleteDependency(part.clone()));
            }
            guards.push(guard);
        }

        let total = self.timed(self.store.concatenate(&session.id, &parts)).await?;
        drop(guards);

        session.declared_length = Some(total);
        session.bytes_received = total;
        self.touch(session);
        self.persist_quietly(session).await;

        tracing::info!(upload_id = %session.id, parts = parts.len(), bytes = total, "Merged partial uploads");
        Ok(())
    }

    /// Dispatch a complete session once and record the outcome
    async fn complete_locked(&self, session: &mut UploadSession) {
        if session.completion != CompletionState::Pending || !session.is_complete() {
            return;
        }

        if session.concat.is_partial() {
            session.completion = CompletionState::Skipped;
            self.persist_quietly(session).await;
            return;
        }

        metrics::record_upload_completed(session.bytes_received);
        let start = Instant::now();

        match self.dispatch(session).await {
            Ok(record) => {
                metrics::record_dispatch("success", start.elapsed().as_secs_f64());
                tracing::info!(
                    upload_id = %session.id,
                    url = %record.url,
                    size = record.size,
                    "Upload completed"
                );
                session.completion = CompletionState::Dispatched { record };
                // The file now lives at its final location
                if let Err(e) = self.timed(self.store.delete(&session.id)).await {
                    tracing::warn!(upload_id = %session.id, error = %e, "Failed to drop dispatched entry");
                }
            }
            Err(e) => {
                metrics::record_dispatch("failure", start.elapsed().as_secs_f64());
                tracing::error!(
                    upload_id = %session.id,
                    error = %e,
                    "Post-processing failed; upload kept for reconciliation"
                );
                session.completion = CompletionState::Failed {
                    reason: e.to_string(),
                };
                self.persist_quietly(session).await;
            }
        }
    }

    async fn dispatch(&self, session: &UploadSession) -> Result<CompletionRecord, DispatchError> {
        let content = self
            .timed(self.store.read(&session.id))
            .await
            .map_err(|e| DispatchError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        self.dispatcher
            .dispatch(CompletedUpload {
                id: session.id.clone(),
                metadata: session.metadata.clone(),
                size: session.bytes_received,
                owner: session.owner.clone(),
                content,
            })
            .await
    }

    async fn set_deferred_length(
        &self,
        session: &mut UploadSession,
        length: u64,
    ) -> Result<(), SessionError> {
        match session.declared_length {
            Some(existing) if existing == length => Ok(()),
            Some(existing) => Err(SessionError::Validation(format!(
                "Upload-Length is already {}",
                existing
            ))),
            None => {
                if length < session.bytes_received {
                    return Err(SessionError::Validation(format!(
                        "Upload-Length {} is below the {} bytes already received",
                        length, session.bytes_received
                    )));
                }
                if let Some(max) = self.policy.max_size {
                    if length > max {
                        return Err(SessionError::TooLarge { size: length, max });
                    }
                }
                session.declared_length = Some(length);
                Ok(())
            }
        }
    }

    async fn write_buffered(
        &self,
        session: &mut UploadSession,
        data: Bytes,
    ) -> Result<(), SessionError> {
        let len = data.len() as u64;
        match self
            .timed(self.store.append(&session.id, session.bytes_received, data))
            .await
        {
            Ok(offset) => {
                session.bytes_received = offset;
                session.offset_unsettled = false;
                metrics::record_bytes_received(len);
                Ok(())
            }
            Err(e @ StoreError::Timeout(_)) => {
                session.offset_unsettled = true;
                self.resync_offset(session).await;
                Err(e.into())
            }
            Err(StoreError::OffsetMismatch { expected, actual }) => {
                // The stored length is authoritative
                tracing::warn!(
                    upload_id = %session.id,
                    recorded = expected,
                    stored = actual,
                    "Adopted stored length after rejected append"
                );
                metrics::record_offset_mismatch();
                session.bytes_received = actual;
                if session.is_complete() {
                    session.offset_unsettled = false;
                    self.complete_locked(session).await;
                }
                self.persist_quietly(session).await;
                Err(SessionError::OffsetMismatch { expected, actual })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Re-read the stored length while a timed out write may still be landing
    async fn settle_offset(&self, session: &mut UploadSession) {
        if !session.offset_unsettled {
            return;
        }
        self.resync_offset(session).await;
        if session.is_complete() {
            session.offset_unsettled = false;
            self.complete_locked(session).await;
            self.persist_quietly(session).await;
        }
    }

    /// Adopt the store's length after an append was cut off mid-write
    async fn resync_offset(&self, session: &mut UploadSession) {
        match self.timed(self.store.length(&session.id)).await {
            Ok(length) if length != session.bytes_received => {
                tracing::warn!(
                    upload_id = %session.id,
                    recorded = session.bytes_received,
                    stored = length,
                    "Resynchronised offset after timed out append"
                );
                session.bytes_received = length;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(upload_id = %session.id, error = %e, "Failed to resync offset");
            }
        }
    }

    fn handle(&self, id: &UploadId) -> Result<SessionHandle, SessionError> {
        self.sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SessionError::NotFound(id.clone()))
    }

    /// Lock a session, treating expired ones as gone
    async fn lock_live(&self, id: &UploadId) -> Result<OwnedMutexGuard<UploadSession>, SessionError> {
        let session = self.handle(id)?.lock_owned().await;
        if expirable(&session, Utc::now()) {
            return Err(SessionError::NotFound(id.clone()));
        }
        Ok(session)
    }

    fn touch(&self, session: &mut UploadSession) {
        let now = Utc::now();
        session.last_activity = now;
        session.expires_at = self.expiry_from(now);
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.policy.expiration)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        now + ttl
    }

    async fn persist(&self, session: &UploadSession) -> Result<(), StoreError> {
        let snapshot = serde_json::to_vec(session)
            .map_err(|e| StoreError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        self.timed(self.store.put_info(&session.id, Bytes::from(snapshot)))
            .await
    }

    async fn persist_quietly(&self, session: &UploadSession) {
        // Dispatched sessions no longer own a store entry
        if matches!(session.completion, CompletionState::Dispatched { .. }) {
            return;
        }
        if let Err(e) = self.persist(session).await {
            tracing::warn!(upload_id = %session.id, error = %e, "Failed to persist session snapshot");
        }
    }

    /// Bound a store call by the configured I/O timeout
    async fn timed<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.policy.io_timeout, op).await {
            Ok(result) => result,
            Err(_) => {
                metrics::record_error("store_timeout");
                Err(StoreError::Timeout(self.policy.io_timeout))
            }
        }
    }
}

fn expirable(session: &UploadSession, now: DateTime<Utc>) -> bool {
    session.is_expired(now) && !matches!(session.completion, CompletionState::Failed { .. })
}

fn concat_label(concat: &ConcatRole) -> &'static str {
    match concat {
        ConcatRole::None => "single",
        ConcatRole::Partial => "partial",
        ConcatRole::Final(_) => "final",
    }
}
