//! The file-drop interface: polls a source directory and turns every
//! dropped file into a request.
//!
//! A file is picked up when its name matches `filename_regex`, handed to
//! the configured handler under a fresh request, and removed once the
//! handler succeeds. A failing handler leaves the file in place, so it is
//! retried on the next scan.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use faststr::FastStr;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use regex::Regex;
use tokio::{sync::Notify, task::JoinHandle};

use crate::{
    error::{Error, Result},
    interface::{Interface, InterfaceContext, InterfaceFactory},
    request::RequestSpec,
    value::{Value, ValueMap},
    value_map,
};

pub struct FileInterface {
    shared: Arc<FileShared>,
}

struct FileShared {
    name: FastStr,
    instance: u64,
    interval: Duration,
    source_dir: PathBuf,
    filename_pattern: Regex,
    handler: FastStr,
    ctx: InterfaceContext,
    ceased: AtomicBool,
    stopping: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FileInterface {
    pub fn factory() -> InterfaceFactory {
        Arc::new(|name, config, ctx| {
            Ok(Arc::new(FileInterface::from_config(name, &config, ctx)?) as Arc<dyn Interface>)
        })
    }

    pub fn from_config(name: FastStr, config: &ValueMap, ctx: InterfaceContext) -> Result<Self> {
        let interval = config
            .get("interval")
            .and_then(Value::as_duration)
            .ok_or_else(|| Error::config("file interface needs a numeric 'interval'"))?;
        let source_dir = config
            .get("source_dir")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::config("file interface needs a 'source_dir'"))?;
        let pattern = config
            .get("filename_regex")
            .and_then(Value::as_str)
            .unwrap_or(".*");
        let handler = config
            .get("handler")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::config("file interface needs a 'handler'"))?;
        Ok(FileInterface {
            shared: Arc::new(FileShared {
                name,
                instance: rand::random(),
                interval,
                source_dir: PathBuf::from(source_dir),
                filename_pattern: Regex::new(pattern)
                    .map_err(|e| Error::config(format!("invalid filename_regex: {e}")))?,
                handler: FastStr::new(handler),
                ctx,
                ceased: AtomicBool::new(false),
                stopping: Notify::new(),
                task: Mutex::new(None),
            }),
        })
    }
}

impl Interface for FileInterface {
    fn name(&self) -> FastStr {
        self.shared.name.clone()
    }

    fn instance_id(&self) -> u64 {
        self.shared.instance
    }

    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.shared.source_dir.is_dir() {
                return Err(Error::config(format!(
                    "source directory {} does not exist",
                    self.shared.source_dir.display()
                )));
            }
            let shared = self.shared.clone();
            let task = tokio::spawn(async move { scan_loop(shared).await });
            *self.shared.task.lock() = Some(task);
            Ok(())
        })
    }

    fn cease(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.shared.ceased.store(true, Ordering::Release);
        })
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.shared.ceased.store(true, Ordering::Release);
            self.shared.stopping.notify_waiters();
            if let Some(task) = self.shared.task.lock().take() {
                task.abort();
            }
        })
    }
}

async fn scan_loop(shared: Arc<FileShared>) {
    loop {
        if !shared.ceased.load(Ordering::Acquire) {
            scan(&shared).await;
        }
        let stopping = shared.stopping.notified();
        tokio::select! {
            _ = stopping => return,
            _ = tokio::time::sleep(shared.interval) => {}
        }
    }
}

async fn scan(shared: &Arc<FileShared>) {
    let mut entries = match tokio::fs::read_dir(&shared.source_dir).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::error!(
                "[AVIARY] interface {} cannot scan {}: {e}",
                shared.name,
                shared.source_dir.display()
            );
            return;
        }
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if shared.ceased.load(Ordering::Acquire) {
            return;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !shared.filename_pattern.is_match(&name) {
            continue;
        }
        if entry.metadata().await.map(|m| m.is_file()).unwrap_or(false) {
            process_file(shared, entry.path(), name).await;
        }
    }
}

async fn process_file(shared: &Arc<FileShared>, path: PathBuf, file_name: String) {
    let request = match shared.ctx.dispatcher.begin_request(RequestSpec {
        interface: shared.name.clone(),
        protocol: FastStr::from_static_str("file"),
        parameters: Value::Map(value_map! { "file_name" => file_name.as_str() }),
        description: format!("file {file_name}").into(),
        ..Default::default()
    }) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(
                "[AVIARY] interface {} cannot pick up {file_name}: {e}",
                shared.name
            );
            return;
        }
    };

    let outcome = match shared.ctx.handlers.get(&shared.handler) {
        Some(handler) => {
            let payload = Value::Map(value_map! {
                "file_name" => file_name.as_str(),
                "path" => path.display().to_string(),
            });
            match shared
                .ctx
                .dispatcher
                .enqueue(&request, move || handler(payload))
                .await
            {
                Ok(handle) => handle.wait().await,
                Err(e) => Err(e),
            }
        }
        None => Err(Error::config(format!(
            "handler '{}' is not registered",
            shared.handler
        ))),
    };

    match outcome {
        Ok(_) => {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::error!(
                    "[AVIARY] interface {} processed {file_name} but cannot remove it: {e}",
                    shared.name
                );
            }
            shared.ctx.dispatcher.end_request(Some(true), &request);
        }
        Err(e) => {
            // the file stays in place and is retried on the next scan
            tracing::error!(
                "[AVIARY] interface {} failed to process {file_name}: {e}",
                shared.name
            );
            shared.ctx.dispatcher.end_request(Some(false), &request);
        }
    }
}
