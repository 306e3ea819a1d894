use crate::{
    record::ResourceRecord,
    store::{Result, StateError, StateStore, Write},
};
use chrono::Utc;
use serde_json::{de::IoRead, Deserializer, StreamDeserializer};
use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::{self, BufReader, Seek as _, Write as _},
    path::{Path, PathBuf},
    sync::{atomic::AtomicBool, Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

const STATE_TYPE: &str = "nixops4AwsState";

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct StateEvent {
    pub index: u64,
    pub meta: StateEventMeta,
    pub patch: json_patch::Patch,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct StateEventMeta {
    pub time: String,
    #[serde(flatten)]
    pub other_fields: serde_json::Value,
}

pub struct StateEventStream<'a, R: io::Read> {
    iter: StreamDeserializer<'a, IoRead<R>, StateEvent>,
    /// The validated first event, handed out by the first call to `next`
    first_event: Option<StateEvent>,
}
impl<'a, R: io::Read> StateEventStream<'a, R> {
    pub fn open_from_reader(reader: R) -> std::result::Result<StateEventStream<'a, R>, String> {
        let deserializer = Deserializer::from_reader(reader);
        let mut iter = deserializer.into_iter();
        let first_event = match iter.next() {
            Some(Ok(ev @ StateEvent { index, .. })) => {
                if index != 0 {
                    return Err(format!(
                        "expected initial state event with index 0, got {}",
                        index
                    ));
                }
                ev
            }
            Some(Err(e)) => return Err(format!("error parsing initial state event: {}", e)),
            None => return Err("no initial state event".to_owned()),
        };
        Ok(StateEventStream {
            iter,
            first_event: Some(first_event),
        })
    }

    /// Number of bytes consumed by the events read so far.
    pub fn byte_offset(&self) -> usize {
        self.iter.byte_offset()
    }
}

impl<R: io::Read> Iterator for StateEventStream<'_, R> {
    type Item = std::result::Result<StateEvent, serde_json::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.first_event.is_some() {
            self.first_event.take().map(Ok)
        } else {
            self.iter.next()
        }
    }
}

pub fn apply_state_event(state: &mut serde_json::Value, event: &StateEvent) -> Result<()> {
    json_patch::patch(state, event.patch.0.as_slice()).map_err(Into::into)
}

pub fn apply_state_events(
    state: &mut serde_json::Value,
    events: impl Iterator<Item = std::result::Result<StateEvent, serde_json::Error>>,
) -> Result<()> {
    for event in events {
        apply_state_event(state, &event?)?;
    }
    Ok(())
}

/// Logs progress of an operation that may block for a long time, such as
/// waiting for another process to release the state file.
///
/// Silent for the first half second, then logs every five seconds until
/// [`WaitMonitor::done`] is called or the monitor is dropped.
pub struct WaitMonitor {
    done: Arc<AtomicBool>,
}
impl WaitMonitor {
    const SILENT_INTERVAL: Duration = Duration::from_millis(500);
    const LOG_INTERVAL: Duration = Duration::from_secs(5);

    pub fn new(activity: String) -> WaitMonitor {
        let done = Arc::new(AtomicBool::new(false));
        let r = WaitMonitor { done: done.clone() };
        std::thread::spawn(move || {
            WaitMonitor::run(done, activity);
        });
        r
    }
    fn run(done: Arc<AtomicBool>, activity: String) {
        let start = Instant::now();
        let mut next_log = start + Self::SILENT_INTERVAL;
        loop {
            if done.load(std::sync::atomic::Ordering::Relaxed) {
                break;
            }
            std::thread::sleep(next_log.saturating_duration_since(Instant::now()));
            if done.load(std::sync::atomic::Ordering::Relaxed) {
                break;
            }
            tracing::info!(
                waited_secs = next_log.duration_since(start).as_secs(),
                "{}",
                activity
            );
            next_log += Self::LOG_INTERVAL;
        }
    }
    pub fn done(&self) {
        self.done.store(true, std::sync::atomic::Ordering::Relaxed);
    }
}
impl Drop for WaitMonitor {
    fn drop(&mut self) {
        self.done()
    }
}

/// Append-only access to the state file.
struct StateHandle {
    path: PathBuf,
    file: Arc<File>,
    locking: fd_lock::RwLock<Arc<File>>,
    expected_size: Option<u64>,
}
impl StateHandle {
    fn open(path: &Path, create_new: bool) -> Result<StateHandle> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(create_new)
            .open(path)
            .map_err(|source| io_error(path, source))?;
        let file = Arc::new(file);
        let locking = fd_lock::RwLock::new(file.clone());
        let mut handle = StateHandle {
            path: path.to_owned(),
            file,
            locking,
            expected_size: None,
        };
        if create_new {
            handle.append(&[&Self::init_event()])?;
        }
        Ok(handle)
    }

    fn init_event() -> StateEvent {
        StateEvent {
            index: 0,
            meta: StateEventMeta {
                time: Utc::now().to_rfc3339(),
                other_fields: serde_json::json!({}),
            },
            patch: json_patch::Patch(vec![json_patch::PatchOperation::Add(
                json_patch::AddOperation {
                    path: Default::default(),
                    value: serde_json::json!({
                        "_type": STATE_TYPE,
                        "resources": {},
                    }),
                },
            )]),
        }
    }

    fn lock_write(
        locking: &mut fd_lock::RwLock<Arc<File>>,
    ) -> io::Result<fd_lock::RwLockWriteGuard<'_, Arc<File>>> {
        let lock_wait_mon = WaitMonitor::new("waiting for state file write lock".to_owned());
        let lock = locking.write()?;
        lock_wait_mon.done();
        Ok(lock)
    }

    /// Drop everything after `len` bytes, for recovering from a torn write.
    fn truncate(&mut self, len: u64) -> Result<()> {
        let path = self.path.clone();
        let lock_guard = Self::lock_write(&mut self.locking).map_err(|e| io_error(&path, e))?;
        self.file.set_len(len).map_err(|e| io_error(&path, e))?;
        (&*self.file)
            .write_all(b"\n")
            .map_err(|e| io_error(&path, e))?;
        self.expected_size = None;
        drop(lock_guard);
        Ok(())
    }

    fn append(&mut self, events: &[&StateEvent]) -> Result<()> {
        self.append_with(events, write_and_flush)
    }

    /// Append `events` with `write`. If it fails, the file is cut back to
    /// where it ended before, so a partly written event never stays behind.
    fn append_with(
        &mut self,
        events: &[&StateEvent],
        write: impl FnOnce(&File, &[u8]) -> io::Result<()>,
    ) -> Result<()> {
        let path = self.path.clone();
        let lock_guard = Self::lock_write(&mut self.locking).map_err(|e| io_error(&path, e))?;
        let pos = self
            .file
            .seek(io::SeekFrom::End(0))
            .map_err(|e| io_error(&path, e))?;
        match self.expected_size {
            None => self.expected_size = Some(pos),
            Some(expected_size) => {
                if pos != expected_size {
                    tracing::error!(
                        expected_size,
                        actual_size = pos,
                        "detected concurrent writing to the state file; concurrent state manipulation may require manual intervention to avoid orphaned cloud resources"
                    );
                }
            }
        }
        let mut bytes = Vec::new();
        for event in events {
            // Pretty printed, so that the file stays readable for humans.
            serde_json::to_writer_pretty(&mut bytes, event)?;
            bytes.push(b'\n');
        }
        if let Err(e) = write(&*self.file, &bytes) {
            if let Err(truncate) = self.file.set_len(pos) {
                tracing::error!(
                    error = %truncate,
                    "could not remove a partly written state event; it will be discarded when the state file is opened again"
                );
            }
            self.expected_size = Some(pos);
            return Err(io_error(&path, e));
        }
        self.expected_size = Some(pos + bytes.len() as u64);

        drop(lock_guard);
        Ok(())
    }
}

fn write_and_flush(mut file: &File, bytes: &[u8]) -> io::Result<()> {
    file.write_all(bytes)?;
    file.flush()
}

fn io_error(path: &Path, source: io::Error) -> StateError {
    StateError::Io {
        path: path.to_owned(),
        source,
    }
}

struct Inner {
    handle: StateHandle,
    doc: serde_json::Value,
    next_index: u64,
}

/// A [`StateStore`] persisted as an append-only log of JSON Patch events.
///
/// Every committed transaction becomes exactly one event, so a commit is
/// either fully in the file or not at all. An event that was cut short by a
/// crash is discarded when the file is opened again.
pub struct EventLogStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl EventLogStore {
    /// Open the state file at `path`, creating it if it does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let created = !path.exists();
        let mut handle = StateHandle::open(path, created)?;
        if created {
            tracing::info!(path = %path.display(), "created new state file");
        }

        let file = File::open(path).map_err(|e| io_error(path, e))?;
        let invalid = |message: String| StateError::Invalid {
            path: path.to_owned(),
            message,
        };
        let mut stream = StateEventStream::open_from_reader(BufReader::new(file)).map_err(invalid)?;

        let mut doc = serde_json::json!({});
        let mut next_index = 0;
        let mut valid_len = 0;
        let mut torn = false;
        while let Some(event) = stream.next() {
            match event {
                Ok(event) => {
                    if event.index != next_index {
                        tracing::warn!(
                            expected = next_index,
                            found = event.index,
                            "state event index out of sequence"
                        );
                    }
                    apply_state_event(&mut doc, &event)?;
                    next_index = event.index + 1;
                    valid_len = stream.byte_offset() as u64;
                }
                Err(e) if e.is_eof() => {
                    tracing::warn!(
                        path = %path.display(),
                        "discarding incomplete state event at the end of the file"
                    );
                    torn = true;
                    break;
                }
                Err(e) => return Err(invalid(format!("error parsing state event: {}", e))),
            }
        }
        if doc.get("_type").and_then(|t| t.as_str()) != Some(STATE_TYPE) {
            return Err(invalid(format!("not a {} file", STATE_TYPE)));
        }
        if !doc.get("resources").is_some_and(|r| r.is_object()) {
            return Err(invalid("missing resources object".to_owned()));
        }
        if torn {
            handle.truncate(valid_len)?;
        }

        Ok(EventLogStore {
            path: path.to_owned(),
            inner: Mutex::new(Inner {
                handle,
                doc,
                next_index,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn resources(doc: &serde_json::Value) -> Option<&serde_json::Map<String, serde_json::Value>> {
    doc.get("resources").and_then(|r| r.as_object())
}

impl StateStore for EventLogStore {
    fn get(&self, name: &str) -> Result<Option<ResourceRecord>> {
        let inner = self.lock();
        match resources(&inner.doc).and_then(|r| r.get(name)) {
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
            None => Ok(None),
        }
    }

    fn snapshot(&self) -> Result<BTreeMap<String, ResourceRecord>> {
        let inner = self.lock();
        let mut out = BTreeMap::new();
        if let Some(resources) = resources(&inner.doc) {
            for (name, v) in resources {
                out.insert(name.clone(), serde_json::from_value(v.clone())?);
            }
        }
        Ok(out)
    }

    fn commit(&self, writes: Vec<Write>) -> Result<()> {
        let mut inner = self.lock();
        let mut new_doc = inner.doc.clone();
        let resources = new_doc
            .get_mut("resources")
            .and_then(|r| r.as_object_mut())
            .ok_or_else(|| StateError::Invalid {
                path: self.path.clone(),
                message: "missing resources object".to_owned(),
            })?;
        let names: Vec<&str> = writes.iter().map(Write::name).collect();
        for write in &writes {
            match write {
                Write::Put { name, record } => {
                    resources.insert(name.clone(), serde_json::to_value(record)?);
                }
                Write::Remove { name } => {
                    resources.remove(name);
                }
            }
        }
        let patch = json_patch::diff(&inner.doc, &new_doc);
        if patch.0.is_empty() {
            return Ok(());
        }
        let event = StateEvent {
            index: inner.next_index,
            meta: StateEventMeta {
                time: Utc::now().to_rfc3339(),
                other_fields: serde_json::json!({ "resources": names }),
            },
            patch,
        };
        inner.handle.append(&[&event])?;
        inner.doc = new_doc;
        inner.next_index += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StateStoreExt as _;
    use nixops4_aws_core::{Lifecycle, Value};
    use std::io::{Read as _, Write as _};

    const BASIC_EXAMPLE: &str = r#"
    {
        "index": 0,
        "meta": {"time":"2019-03-04T07:40:00Z"},
        "patch": [
            {
                "op": "add",
                "value": { "_type": "nixops4AwsState", "resources": {} },
                "path": ""
            }
        ]
    }
    {
        "index": 1,
        "meta": {"time":"2019-03-04T07:41:00Z", "resources": ["main"]},
        "patch": [
            {
                "op": "add",
                "value": {
                    "type": "vpc",
                    "lifecycle": "UP",
                    "resourceId": "vpc-123",
                    "attributes": { "region": "us-east-1" }
                },
                "path": "/resources/main"
            }
        ]
    }
"#;

    fn up_record(id: &str) -> ResourceRecord {
        let mut r = ResourceRecord::new("vpc");
        r.lifecycle = Lifecycle::Up;
        r.resource_id = Some(id.to_owned());
        r.attributes
            .insert("region".to_owned(), Value::from("us-east-1"));
        r
    }

    #[test]
    fn test_open_state_stream() {
        let stream = StateEventStream::open_from_reader(BASIC_EXAMPLE.as_bytes()).unwrap();
        let events: Vec<_> = stream.collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref().unwrap().index, 0);
        assert_eq!(
            events[1].as_ref().unwrap().meta.other_fields,
            serde_json::json!({"resources": ["main"]})
        );
    }

    #[test]
    fn test_resolve_state() {
        let stream = StateEventStream::open_from_reader(BASIC_EXAMPLE.as_bytes()).unwrap();
        let mut state = serde_json::json!({});
        apply_state_events(&mut state, stream).unwrap();
        let record: ResourceRecord =
            serde_json::from_value(state["resources"]["main"].clone()).unwrap();
        assert_eq!(record, up_record("vpc-123"));
    }

    #[test]
    fn test_open_state_stream_invalid_first_event() {
        for input in [
            r#"{"index":1,"meta":{"time":"2019-06-04T07:40:00Z"},"patch":[]}"#,
            r#"{"meta":{"time":"2019-06-04T07:40:00Z"},"patch":[]}"#,
            r#"{"index":0,"meta":{"time":"2019-06-04T07:40:00Z"},"patch":[]"#,
            r#""#,
            r#"[]"#,
            r#"{"index":0,"patch":[{}]}"#,
        ] {
            assert!(
                StateEventStream::open_from_reader(input.as_bytes()).is_err(),
                "accepted {:?}",
                input
            );
        }
    }

    #[test]
    fn test_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = EventLogStore::open(&path).unwrap();
            let mut tx = store.begin();
            tx.put("main", up_record("vpc-123"));
            tx.commit().unwrap();
            let mut tx = store.begin();
            tx.put("other", ResourceRecord::new("vpc"));
            tx.commit().unwrap();
            let mut tx = store.begin();
            tx.remove("other");
            tx.commit().unwrap();
        }
        let store = EventLogStore::open(&path).unwrap();
        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot["main"], up_record("vpc-123"));

        let mut contents = String::new();
        File::open(&path)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        let indices: Vec<u64> = StateEventStream::open_from_reader(contents.as_bytes())
            .unwrap()
            .map(|e| e.unwrap().index)
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_noop_commit_appends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = EventLogStore::open(&path).unwrap();
        let mut tx = store.begin();
        tx.put("main", up_record("vpc-123"));
        tx.commit().unwrap();
        let len = std::fs::metadata(&path).unwrap().len();
        let mut tx = store.begin();
        tx.put("main", up_record("vpc-123"));
        tx.commit().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), len);
    }

    #[test]
    fn test_torn_trailing_event_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = EventLogStore::open(&path).unwrap();
            let mut tx = store.begin();
            tx.put("main", up_record("vpc-123"));
            tx.commit().unwrap();
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(br#"{"index": 2, "meta": {"time": "2019"#)
                .unwrap();
        }
        let store = EventLogStore::open(&path).unwrap();
        assert_eq!(store.get("main").unwrap(), Some(up_record("vpc-123")));

        let mut tx = store.begin();
        tx.put("second", up_record("vpc-456"));
        tx.commit().unwrap();
        drop(store);

        let store = EventLogStore::open(&path).unwrap();
        assert_eq!(store.snapshot().unwrap().len(), 2);
    }

    #[test]
    fn test_failed_append_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        drop(EventLogStore::open(&path).unwrap());
        let len = std::fs::metadata(&path).unwrap().len();

        let mut handle = StateHandle::open(&path, false).unwrap();
        let event = StateEvent {
            index: 1,
            meta: StateEventMeta {
                time: "2019-03-04T07:41:00Z".to_owned(),
                other_fields: serde_json::json!({}),
            },
            patch: json_patch::Patch(vec![]),
        };
        let err = handle
            .append_with(&[&event], |mut file, bytes| {
                file.write_all(&bytes[..bytes.len() / 2])?;
                Err(io::Error::other("disk full"))
            })
            .unwrap_err();
        assert!(matches!(err, StateError::Io { .. }));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), len);
        assert_eq!(handle.expected_size, Some(len));

        handle.append(&[&event]).unwrap();
        let len_after = std::fs::metadata(&path).unwrap().len();
        assert!(len_after > len);
        assert_eq!(handle.expected_size, Some(len_after));
        drop(handle);

        let mut contents = String::new();
        File::open(&path)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        let indices: Vec<u64> = StateEventStream::open_from_reader(contents.as_bytes())
            .unwrap()
            .map(|e| e.unwrap().index)
            .collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    fn test_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(
            &path,
            r#"{"index":0,"meta":{"time":"x"},"patch":[{"op":"add","path":"","value":{"_type":"nixopsState","resources":{}}}]}"#,
        )
        .unwrap();
        assert!(matches!(
            EventLogStore::open(&path),
            Err(StateError::Invalid { .. })
        ));
    }

    #[test]
    #[ignore] // Slow test, no assertions
    fn test_wait_monitor() {
        let monitor = WaitMonitor::new("testing...".to_owned());
        std::thread::sleep(Duration::from_secs(12));
        monitor.done();
    }
}
