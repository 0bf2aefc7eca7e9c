//! In-memory collaborators for unit tests.

use crate::notify::{NotificationEvent, Notifier};
use crate::replication::{ObjectInfo, ObjectStore};
use crate::runtime::ServiceRuntime;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

/// Scripted stand-in for `docker compose`.
pub struct FakeRuntime {
    reachable: bool,
    compose_present: bool,
    running: Mutex<HashSet<String>>,
    container_files: Mutex<HashMap<(String, String), Vec<u8>>>,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
    inputs: Mutex<Vec<(String, Vec<u8>)>>,
    dump: Vec<u8>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            reachable: true,
            compose_present: true,
            running: Mutex::new(HashSet::new()),
            container_files: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            inputs: Mutex::new(Vec::new()),
            dump: b"--\n-- PostgreSQL database dump\n--\nCREATE TABLE users (id integer);\n"
                .to_vec(),
        }
    }

    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    pub fn without_compose(mut self) -> Self {
        self.compose_present = false;
        self
    }

    pub fn with_running(self, services: &[&str]) -> Self {
        self.running
            .lock()
            .unwrap()
            .extend(services.iter().map(|s| s.to_string()));
        self
    }

    pub fn with_container_file(self, service: &str, path: &str, content: &[u8]) -> Self {
        self.container_files
            .lock()
            .unwrap()
            .insert((service.to_string(), path.to_string()), content.to_vec());
        self
    }

    /// Make every exec with `arg` among its arguments fail.
    pub fn failing(self, arg: &str) -> Self {
        self.failing.lock().unwrap().insert(arg.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn inputs(&self, service: &str) -> Vec<Vec<u8>> {
        self.inputs
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == service)
            .map(|(_, data)| data.clone())
            .collect()
    }

    pub fn running(&self, service: &str) -> bool {
        self.running.lock().unwrap().contains(service)
    }

    pub fn container_file(&self, service: &str, path: &str) -> Option<Vec<u8>> {
        self.container_files
            .lock()
            .unwrap()
            .get(&(service.to_string(), path.to_string()))
            .cloned()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn require_running(&self, service: &str) -> Result<()> {
        if self.running(service) {
            Ok(())
        } else {
            Err(BackupError::Runtime(format!("service {} is not running", service)))
        }
    }
}

#[async_trait]
impl ServiceRuntime for FakeRuntime {
    async fn engine_version(&self) -> Result<String> {
        if self.reachable {
            Ok("27.1.1".to_string())
        } else {
            Err(BackupError::Runtime("Cannot connect to the Docker daemon".into()))
        }
    }

    async fn compose_version(&self) -> Result<String> {
        if self.compose_present {
            Ok("2.29.1".to_string())
        } else {
            Err(BackupError::Runtime("compose: command not found".into()))
        }
    }

    async fn is_running(&self, service: &str) -> Result<bool> {
        Ok(self.running(service))
    }

    async fn exec(&self, service: &str, args: &[&str]) -> Result<Vec<u8>> {
        self.record(format!("exec {} {}", service, args.join(" ")));
        self.require_running(service)?;

        let program = args.first().copied().unwrap_or_default();
        let fails = {
            let failing = self.failing.lock().unwrap();
            args.iter().any(|arg| failing.contains(*arg))
        };
        if fails {
            return Err(BackupError::Runtime(format!("{} exited with status 1", program)));
        }

        let out: Vec<u8> = match program {
            "pg_dump" if args.contains(&"--data-only") => b"COPY users (id) FROM stdin;\n1\n\\.\n".to_vec(),
            "pg_dump" if args.contains(&"--schema-only") => b"CREATE TABLE users (id integer);\n".to_vec(),
            "pg_dump" => self.dump.clone(),
            "psql" if args.contains(&"--version") => b"psql (PostgreSQL) 16.4\n".to_vec(),
            "redis-server" => b"Redis server v=7.2.5 sha=00000000:0 malloc=jemalloc-5.3.0 bits=64\n".to_vec(),
            "redis-cli" => b"OK\n".to_vec(),
            _ => Vec::new(),
        };
        Ok(out)
    }

    async fn exec_with_input(&self, service: &str, args: &[&str], input: Vec<u8>) -> Result<()> {
        self.record(format!("exec_with_input {} {}", service, args.join(" ")));
        self.require_running(service)?;
        self.inputs.lock().unwrap().push((service.to_string(), input));
        Ok(())
    }

    async fn copy_from(&self, service: &str, container_path: &str, host_path: &Path) -> Result<()> {
        self.record(format!("copy_from {} {}", service, container_path));
        let content = self
            .container_file(service, container_path)
            .ok_or_else(|| BackupError::Runtime(format!("no such file {}:{}", service, container_path)))?;
        std::fs::write(host_path, content)?;
        Ok(())
    }

    async fn copy_to(&self, service: &str, host_path: &Path, container_path: &str) -> Result<()> {
        self.record(format!("copy_to {} {}", service, container_path));
        let content = std::fs::read(host_path)?;
        self.container_files
            .lock()
            .unwrap()
            .insert((service.to_string(), container_path.to_string()), content);
        Ok(())
    }

    async fn stop(&self, services: &[String]) -> Result<()> {
        self.record(format!("stop {}", services.join(",")));
        let mut running = self.running.lock().unwrap();
        for service in services {
            running.remove(service);
        }
        Ok(())
    }

    async fn start(&self, services: &[String]) -> Result<()> {
        self.record(format!("start {}", services.join(",")));
        self.running
            .lock()
            .unwrap()
            .extend(services.iter().cloned());
        Ok(())
    }

    async fn logs(&self, service: &str, tail: usize) -> Result<Vec<u8>> {
        self.record(format!("logs {} {}", service, tail));
        Ok(format!("{} | started\n{} | ready\n", service, service).into_bytes())
    }
}

/// Notifier that keeps every event it receives.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<NotificationEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn report(&self, event: &NotificationEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Object store kept in memory; uploads can be made to fail.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, u64>>,
    fail_uploads: bool,
}

impl MemoryObjectStore {
    pub fn failing() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            fail_uploads: true,
        }
    }

    pub fn insert(&self, key: &str, size: u64) {
        self.objects.lock().unwrap().insert(key.to_string(), size);
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_file(&self, key: &str, path: &Path) -> Result<u64> {
        if self.fail_uploads {
            return Err(BackupError::Replication("connection reset by peer".into()));
        }
        let size = std::fs::metadata(path)?.len();
        self.insert(key, size);
        Ok(size)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, size)| ObjectInfo {
                key: key.clone(),
                size_bytes: *size,
                last_modified: Utc::now(),
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}
