use std::{
  sync::{Arc, Condvar, Mutex},
  thread::JoinHandle,
  time::Duration,
};

use crate::{Task, Update};

#[derive(Default)]
struct Pending {
  update: Option<Update>,
  extra_info: Option<Vec<String>>,
  stopped: bool,
}

struct Channel {
  pending: Mutex<Pending>,
  cvar: Condvar,
}

/// Applies only the latest recorded values to a [Task], at most once
/// per interval, from a background flusher thread. Intermediate
/// values recorded between flushes are dropped; the final values are
/// always flushed when the updater is dropped.
pub struct RateLimitedUpdater {
  channel: Arc<Channel>,
  flusher: Option<JoinHandle<()>>,
}

impl RateLimitedUpdater {
  pub(crate) fn new(
    task: Task,
    interval: Duration,
  ) -> RateLimitedUpdater {
    let channel = Arc::new(Channel {
      pending: Mutex::new(Pending::default()),
      cvar: Condvar::new(),
    });
    let flusher_channel = channel.clone();
    let flusher = std::thread::spawn(move || {
      loop {
        let (update, extra_info, stopped) = {
          let guard = flusher_channel
            .pending
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
          let (mut guard, _timeout) = flusher_channel
            .cvar
            .wait_timeout(guard, interval)
            .unwrap_or_else(|poison| poison.into_inner());
          (
            guard.update.take(),
            guard.extra_info.take(),
            guard.stopped,
          )
        };
        if let Some(update) = update {
          task.update(update);
        }
        if let Some(extra_info) = extra_info {
          task.set_extra_info(extra_info);
        }
        if stopped {
          break;
        }
      }
    });
    RateLimitedUpdater {
      channel,
      flusher: Some(flusher),
    }
  }

  /// Records an update; fields already pending but not named here
  /// keep their pending value.
  pub fn update(&self, update: Update) {
    let mut pending = self
      .channel
      .pending
      .lock()
      .unwrap_or_else(|poison| poison.into_inner());
    let merged = pending.update.take().unwrap_or_default();
    pending.update = Some(Update {
      status: update.status.or(merged.status),
      status_flavor: update.status_flavor.or(merged.status_flavor),
      progress: update.progress.or(merged.progress),
    });
  }

  pub fn set_extra_info(&self, lines: Vec<String>) {
    let mut pending = self
      .channel
      .pending
      .lock()
      .unwrap_or_else(|poison| poison.into_inner());
    pending.extra_info = Some(lines);
  }
}

impl Drop for RateLimitedUpdater {
  fn drop(&mut self) {
    {
      let mut pending = self
        .channel
        .pending
        .lock()
        .unwrap_or_else(|poison| poison.into_inner());
      pending.stopped = true;
    }
    self.channel.cvar.notify_one();
    if let Some(flusher) = self.flusher.take() {
      let _ = flusher.join();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::TaskTree;
  use std::io::Write;
  use std::sync::Arc;

  #[derive(Clone, Default)]
  struct SharedBuf(Arc<Mutex<Vec<u8>>>);

  impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
      self.0.lock().unwrap().extend_from_slice(buf);
      Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
      Ok(())
    }
  }

  #[test]
  fn final_values_flush_on_drop() {
    let buf = SharedBuf::default();
    let tree = TaskTree::with_writer(Box::new(buf.clone()));
    let task = tree.root().subtask("pull");
    {
      let updater = task.rate_limited(Duration::from_secs(60));
      for i in 0..100u64 {
        updater.update(Update::progress(i, 100));
      }
      updater.set_extra_info(vec![String::from("layer abc")]);
    }
    let out = String::from_utf8_lossy(&buf.0.lock().unwrap())
      .into_owned();
    // Only the last recorded progress is applied.
    assert!(out.contains("99/100"));
    assert!(!out.contains("50/100"));
    assert!(out.contains("layer abc"));
  }
}
