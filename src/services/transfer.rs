//! Streaming transfer coordinator.
//!
//! Serves a download against the blob and, when the producing upload is still
//! in flight, against its session: the stream reads sequentially and parks in
//! `await_more_data` whenever it reaches the end of the written region before
//! the end of the object. Once a session is gone (or complete) the blob is a
//! plain fixed-size file and standard byte-range semantics apply.

use crate::models::object::StoredObject;
use crate::services::session::{SessionProgress, SessionRegistry, UploadSession};
use crate::services::store::{ObjectStore, StoreError, StoreResult};
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use std::io::{self, SeekFrom};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

/// Read granularity of the session-aware stream loop.
const READ_CHUNK: usize = 4096;

/// A byte range as parsed from a `Range` header: start offset plus an
/// optional inclusive end.
#[derive(Debug, Clone, Copy)]
pub struct RangeRequest {
    pub start: i64,
    pub end: Option<i64>,
}

/// Content-Range triple for a partial response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: i64,
    pub last: i64,
    pub total: i64,
}

/// A resolved download: response metadata plus the byte stream itself.
pub struct Transfer {
    pub object: StoredObject,
    /// Total bytes the stream will carry; absent when the upload's size is
    /// still unknown.
    pub content_length: Option<i64>,
    pub is_partial: bool,
    pub content_range: Option<ContentRange>,
    pub stream: BoxStream<'static, io::Result<Bytes>>,
}

/// Resolve a download for `id`, attaching to a live upload session when one
/// exists.
pub async fn serve(
    store: &ObjectStore,
    sessions: &SessionRegistry,
    id: &str,
    range: Option<RangeRequest>,
) -> StoreResult<Transfer> {
    let object = store.fetch_object(id).await?;
    match sessions.lookup(id) {
        Some(session) if session.is_cancelled() => Err(StoreError::NotFound),
        Some(session) if !session.is_complete() => {
            serve_streaming(store, object, session, range).await
        }
        Some(session) => {
            // Completed but not yet evicted: the session already knows the
            // final size, no need to stat the blob.
            let total = session.available();
            serve_fixed(store, object, total, range).await
        }
        None => {
            let total = store.blob_len(id).await?;
            serve_fixed(store, object, total, range).await
        }
    }
}

/// Serve a blob whose size is final. Standard range semantics: a start at or
/// past the end is unsatisfiable, an end past the end is clamped, malformed
/// ranges are ignored.
async fn serve_fixed(
    store: &ObjectStore,
    object: StoredObject,
    total: i64,
    range: Option<RangeRequest>,
) -> StoreResult<Transfer> {
    let mut file = store.open_blob(&object.id).await?;
    if let Some(range) = range {
        if let Some((start, stop)) = resolve_fixed_range(range, total)? {
            file.seek(SeekFrom::Start(start as u64)).await?;
            let stream = ReaderStream::new(file.take((stop - start) as u64));
            return Ok(Transfer {
                object,
                content_length: Some(stop - start),
                is_partial: true,
                content_range: Some(ContentRange {
                    start,
                    last: stop - 1,
                    total,
                }),
                stream: stream.boxed(),
            });
        }
    }
    Ok(Transfer {
        object,
        content_length: Some(total),
        is_partial: false,
        content_range: None,
        stream: ReaderStream::new(file).boxed(),
    })
}

/// Serve a blob still being produced by an open upload session.
async fn serve_streaming(
    store: &ObjectStore,
    object: StoredObject,
    session: Arc<UploadSession>,
    range: Option<RangeRequest>,
) -> StoreResult<Transfer> {
    let declared = session.declared_size();
    let mut offset = 0i64;
    let mut remaining: Option<i64> = if declared >= 0 { Some(declared) } else { None };
    let mut is_partial = false;
    let mut content_range = None;

    if declared >= 0 {
        if let Some(range) = range {
            // A range is honored only when its bounds are guaranteed: fully
            // inside the declared size and entirely written already. Anything
            // else falls back to serving the whole object from the start.
            if let Some((start, stop)) =
                resolve_open_range(range, declared, session.available())
            {
                offset = start;
                remaining = Some(stop - start);
                is_partial = true;
                content_range = Some(ContentRange {
                    start,
                    last: stop - 1,
                    total: declared,
                });
            }
        }
    }

    let mut file = store.open_blob(&object.id).await?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset as u64)).await?;
    }

    Ok(Transfer {
        object,
        content_length: remaining,
        is_partial,
        content_range,
        stream: session_stream(file, session, offset, remaining),
    })
}

struct StreamState {
    file: File,
    session: Arc<UploadSession>,
    position: i64,
    remaining: Option<i64>,
}

/// Sequential read loop over a growing blob.
///
/// At end-of-file with the target unreached, parks on the session until more
/// bytes land or the session ends. Cancellation and stall timeouts surface as
/// stream errors, which terminate the connection mid-transfer.
fn session_stream(
    file: File,
    session: Arc<UploadSession>,
    position: i64,
    remaining: Option<i64>,
) -> BoxStream<'static, io::Result<Bytes>> {
    let state = StreamState {
        file,
        session,
        position,
        remaining,
    };
    stream::try_unfold(state, |mut state| async move {
        loop {
            if state.remaining == Some(0) {
                return Ok(None);
            }
            let want = match state.remaining {
                Some(left) => READ_CHUNK.min(left as usize),
                None => READ_CHUNK,
            };
            let mut buffer = vec![0u8; want];
            let count = state.file.read(&mut buffer).await?;
            if count > 0 {
                state.position += count as i64;
                if let Some(left) = &mut state.remaining {
                    *left -= count as i64;
                }
                buffer.truncate(count);
                return Ok(Some((Bytes::from(buffer), state)));
            }
            match state.session.await_more_data(state.position).await {
                Ok(SessionProgress::Advanced(_)) => continue,
                Ok(SessionProgress::Finished(_)) => {
                    if state.remaining.is_some_and(|left| left > 0) {
                        return Err(io::Error::other("upload ended before its declared size"));
                    }
                    return Ok(None);
                }
                Err(err) => return Err(io::Error::other(StoreError::from(err))),
            }
        }
    })
    .boxed()
}

/// Range resolution against a final size; returns the half-open window to
/// serve, `None` to ignore the range, or `RangeUnsatisfiable`.
fn resolve_fixed_range(range: RangeRequest, total: i64) -> StoreResult<Option<(i64, i64)>> {
    if range.start < 0 {
        return Ok(None);
    }
    if range.start >= total {
        return Err(StoreError::RangeUnsatisfiable { size: total });
    }
    let stop = match range.end {
        Some(end) if end < range.start => return Ok(None),
        Some(end) => (end + 1).min(total),
        None => total,
    };
    Ok(Some((range.start, stop)))
}

/// Range resolution against an open session: honored only when the window is
/// inside the declared size and already fully written, never an error.
fn resolve_open_range(range: RangeRequest, declared: i64, available: i64) -> Option<(i64, i64)> {
    let stop = match range.end {
        Some(end) => end + 1,
        None => declared,
    };
    if range.start >= 0 && stop > range.start && stop <= declared && stop <= available {
        Some((range.start, stop))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::session::SessionRegistry;
    use chrono::{Duration, Utc};
    use std::time::Duration as StdDuration;
    use tempfile::tempdir;
    use uuid::Uuid;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: ObjectStore,
        sessions: SessionRegistry,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        let sessions = SessionRegistry::new(store.clone());
        Fixture {
            _dir: dir,
            store,
            sessions,
        }
    }

    async fn record_for(store: &ObjectStore, id: &str) {
        let object = StoredObject {
            id: id.to_string(),
            display_name: "payload.bin".into(),
            media_type: "application/octet-stream".into(),
            expires_at: Utc::now() + Duration::hours(48),
            owner_address: "127.0.0.1".into(),
            owner_identity: Uuid::new_v4(),
        };
        store.write_record(&object).await.unwrap();
    }

    async fn collect(mut stream: BoxStream<'static, io::Result<Bytes>>) -> io::Result<Vec<u8>> {
        let mut bytes = Vec::new();
        while let Some(chunk) = stream.next().await {
            bytes.extend_from_slice(&chunk?);
        }
        Ok(bytes)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn reader_attached_mid_upload_sees_every_byte_in_order() {
        let fx = fixture();
        let data = pattern(1000);
        let session = fx.sessions.reserve(Uuid::new_v4(), 1000);
        let id = session.id().to_string();
        record_for(&fx.store, &id).await;

        let mut writer = fx.store.begin_blob(Arc::clone(&session)).await.unwrap();
        writer.write(&data[..300]).await.unwrap();

        let transfer = serve(&fx.store, &fx.sessions, &id, None).await.unwrap();
        assert_eq!(transfer.content_length, Some(1000));
        assert!(!transfer.is_partial);
        let reader = tokio::spawn(collect(transfer.stream));

        writer.write(&data[300..700]).await.unwrap();
        writer.write(&data[700..]).await.unwrap();
        writer.finish().await.unwrap();

        assert_eq!(reader.await.unwrap().unwrap(), data);
    }

    #[tokio::test]
    async fn unknown_size_streams_until_completion() {
        let fx = fixture();
        let data = pattern(9000);
        let session = fx.sessions.reserve(Uuid::new_v4(), -1);
        let id = session.id().to_string();
        record_for(&fx.store, &id).await;

        let mut writer = fx.store.begin_blob(Arc::clone(&session)).await.unwrap();
        writer.write(&data[..1]).await.unwrap();

        let transfer = serve(&fx.store, &fx.sessions, &id, None).await.unwrap();
        assert_eq!(transfer.content_length, None);
        let reader = tokio::spawn(collect(transfer.stream));

        writer.write(&data[1..6000]).await.unwrap();
        writer.write(&data[6000..]).await.unwrap();
        writer.finish().await.unwrap();

        assert_eq!(reader.await.unwrap().unwrap(), data);
    }

    #[tokio::test]
    async fn range_within_available_bytes_is_honored() {
        let fx = fixture();
        let data = pattern(1000);
        let session = fx.sessions.reserve(Uuid::new_v4(), 1000);
        let id = session.id().to_string();
        record_for(&fx.store, &id).await;

        let mut writer = fx.store.begin_blob(Arc::clone(&session)).await.unwrap();
        writer.write(&data[..400]).await.unwrap();

        let range = RangeRequest {
            start: 100,
            end: Some(299),
        };
        let transfer = serve(&fx.store, &fx.sessions, &id, Some(range))
            .await
            .unwrap();
        assert!(transfer.is_partial);
        assert_eq!(transfer.content_length, Some(200));
        assert_eq!(
            transfer.content_range,
            Some(ContentRange {
                start: 100,
                last: 299,
                total: 1000
            })
        );
        assert_eq!(collect(transfer.stream).await.unwrap(), &data[100..300]);
    }

    #[tokio::test]
    async fn range_past_available_bytes_falls_back_to_full_serve() {
        let fx = fixture();
        let data = pattern(1000);
        let session = fx.sessions.reserve(Uuid::new_v4(), 1000);
        let id = session.id().to_string();
        record_for(&fx.store, &id).await;

        let mut writer = fx.store.begin_blob(Arc::clone(&session)).await.unwrap();
        writer.write(&data[..400]).await.unwrap();

        let range = RangeRequest {
            start: 100,
            end: Some(899),
        };
        let transfer = serve(&fx.store, &fx.sessions, &id, Some(range))
            .await
            .unwrap();
        assert!(!transfer.is_partial);
        assert_eq!(transfer.content_length, Some(1000));
        let reader = tokio::spawn(collect(transfer.stream));

        writer.write(&data[400..]).await.unwrap();
        writer.finish().await.unwrap();
        assert_eq!(reader.await.unwrap().unwrap(), data);
    }

    #[tokio::test]
    async fn cancellation_aborts_a_parked_reader() {
        let fx = fixture();
        let session = fx.sessions.reserve(Uuid::new_v4(), 1000);
        let id = session.id().to_string();
        record_for(&fx.store, &id).await;

        let mut writer = fx.store.begin_blob(Arc::clone(&session)).await.unwrap();
        writer.write(&pattern(100)).await.unwrap();

        let transfer = serve(&fx.store, &fx.sessions, &id, None).await.unwrap();
        let reader = tokio::spawn(collect(transfer.stream));
        tokio::task::yield_now().await;

        session.mark_cancelled();
        let result = reader.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_upload_times_a_reader_out() {
        let fx = fixture();
        let session = fx.sessions.reserve(Uuid::new_v4(), 1000);
        let id = session.id().to_string();
        record_for(&fx.store, &id).await;

        let mut writer = fx.store.begin_blob(Arc::clone(&session)).await.unwrap();
        writer.write(&pattern(100)).await.unwrap();

        let transfer = serve(&fx.store, &fx.sessions, &id, None).await.unwrap();
        let result = collect(transfer.stream).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn new_readers_are_refused_after_cancellation() {
        let fx = fixture();
        let session = fx.sessions.reserve(Uuid::new_v4(), 1000);
        let id = session.id().to_string();
        record_for(&fx.store, &id).await;

        let mut writer = fx.store.begin_blob(Arc::clone(&session)).await.unwrap();
        writer.write(&pattern(100)).await.unwrap();
        session.mark_cancelled();

        assert!(matches!(
            serve(&fx.store, &fx.sessions, &id, None).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn completed_blob_serves_standard_ranges() {
        let fx = fixture();
        let data = pattern(100);
        let id = "777777";
        record_for(&fx.store, id).await;
        tokio::fs::write(fx.store.blob_path(id), &data).await.unwrap();

        let range = RangeRequest {
            start: 20,
            end: Some(49),
        };
        let transfer = serve(&fx.store, &fx.sessions, id, Some(range))
            .await
            .unwrap();
        assert!(transfer.is_partial);
        assert_eq!(collect(transfer.stream).await.unwrap(), &data[20..50]);

        // Open-ended range runs to the final byte.
        let transfer = serve(
            &fx.store,
            &fx.sessions,
            id,
            Some(RangeRequest {
                start: 90,
                end: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(collect(transfer.stream).await.unwrap(), &data[90..]);

        // A start at or past the end is unsatisfiable.
        assert!(matches!(
            serve(
                &fx.store,
                &fx.sessions,
                id,
                Some(RangeRequest {
                    start: 100,
                    end: None
                })
            )
            .await,
            Err(StoreError::RangeUnsatisfiable { size: 100 })
        ));
    }

    #[tokio::test]
    async fn completed_session_serves_like_a_fixed_blob() {
        let fx = fixture();
        let data = pattern(64);
        let session = fx.sessions.reserve(Uuid::new_v4(), 64);
        let id = session.id().to_string();
        record_for(&fx.store, &id).await;

        let mut writer = fx.store.begin_blob(Arc::clone(&session)).await.unwrap();
        writer.write(&data).await.unwrap();
        writer.finish().await.unwrap();

        let transfer = serve(&fx.store, &fx.sessions, &id, None).await.unwrap();
        assert_eq!(transfer.content_length, Some(64));
        assert_eq!(collect(transfer.stream).await.unwrap(), data);
    }

    #[tokio::test(start_paused = true)]
    async fn reader_timeout_is_local_not_shared() {
        let fx = fixture();
        let session = fx.sessions.reserve(Uuid::new_v4(), 200);
        let id = session.id().to_string();
        record_for(&fx.store, &id).await;

        let mut writer = fx.store.begin_blob(Arc::clone(&session)).await.unwrap();
        writer.write(&pattern(100)).await.unwrap();

        // First reader parks and eventually stalls out.
        let first = serve(&fx.store, &fx.sessions, &id, None).await.unwrap();
        let first = tokio::spawn(collect(first.stream));
        tokio::time::sleep(StdDuration::from_secs(10)).await;

        // Second reader attaches 10s into the stall and must still get its
        // own full window rather than inheriting the first reader's clock.
        let second = serve(&fx.store, &fx.sessions, &id, None).await.unwrap();
        let started = tokio::time::Instant::now();
        let second = tokio::spawn(collect(second.stream));

        assert!(first.await.unwrap().is_err());
        assert!(second.await.unwrap().is_err());
        assert!(started.elapsed() >= StdDuration::from_secs(15));
    }
}
