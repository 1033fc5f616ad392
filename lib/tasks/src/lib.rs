//! Hierarchical progress reporting for the terminal.
//!
//! A [TaskTree] holds an arena of task nodes behind one lock. Any
//! worker thread may mutate its [Task] handle; every mutation
//! re-renders the whole tree in place using ANSI cursor control, so
//! the terminal always shows the live state of all tasks at once.

use std::{
  io::Write,
  sync::{Arc, Mutex, MutexGuard},
};

use colored::Colorize;

mod limiter;

pub use limiter::RateLimitedUpdater;

pub const UP_ONE: &str = "\x1b[A\x1b[1000D";
pub const CLEAR_LINE: &str = "\x1b[2K";

const INDENT: &str = "  ";
const PROGRESS_BAR_WIDTH: usize = 30;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatusFlavor {
  #[default]
  Neutral,
  Good,
  Bad,
  Warning,
}

/// A partial mutation of a task. Fields left as `None` keep their
/// current value.
#[derive(Debug, Clone, Default)]
pub struct Update {
  pub status: Option<String>,
  pub status_flavor: Option<StatusFlavor>,
  pub progress: Option<(u64, u64)>,
}

impl Update {
  pub fn status(status: impl Into<String>) -> Update {
    Update {
      status: Some(status.into()),
      ..Default::default()
    }
  }

  pub fn flavored(
    status: impl Into<String>,
    status_flavor: StatusFlavor,
  ) -> Update {
    Update {
      status: Some(status.into()),
      status_flavor: Some(status_flavor),
      ..Default::default()
    }
  }

  pub fn progress(count: u64, total: u64) -> Update {
    Update {
      progress: Some((count, total)),
      ..Default::default()
    }
  }
}

struct Node {
  name: String,
  subtasks: Vec<usize>,
  status: Option<String>,
  status_flavor: StatusFlavor,
  progress: Option<(u64, u64)>,
  extra_info: Vec<String>,
  finished: bool,
}

impl Node {
  fn new(name: String) -> Node {
    Node {
      name,
      subtasks: Vec::new(),
      status: None,
      status_flavor: StatusFlavor::Neutral,
      progress: None,
      extra_info: Vec::new(),
      finished: false,
    }
  }
}

struct TreeState {
  nodes: Vec<Node>,
  /// Rows currently occupied by the last render.
  cleared_lines: usize,
  /// Rendering is suspended while > 0, see [Task::paused_output].
  pause_depth: usize,
  writer: Box<dyn Write + Send>,
}

struct Shared {
  state: Mutex<TreeState>,
}

const ROOT: usize = 0;

/// The tree of progress nodes. The root is a sentinel with no line
/// of its own; everything visible hangs off [TaskTree::root].
pub struct TaskTree {
  shared: Arc<Shared>,
}

impl Default for TaskTree {
  fn default() -> TaskTree {
    TaskTree::new()
  }
}

impl TaskTree {
  pub fn new() -> TaskTree {
    TaskTree::with_writer(Box::new(std::io::stdout()))
  }

  /// Render into an arbitrary sink instead of stdout.
  pub fn with_writer(writer: Box<dyn Write + Send>) -> TaskTree {
    TaskTree {
      shared: Arc::new(Shared {
        state: Mutex::new(TreeState {
          nodes: vec![Node::new(String::from("__root__"))],
          cleared_lines: 0,
          pause_depth: 0,
          writer,
        }),
      }),
    }
  }

  pub fn root(&self) -> Task {
    Task {
      shared: self.shared.clone(),
      id: ROOT,
    }
  }
}

/// Cheap handle on one node of a [TaskTree]. Clone freely and send
/// across threads; all mutation is serialised by the tree lock.
#[derive(Clone)]
pub struct Task {
  shared: Arc<Shared>,
  id: usize,
}

impl Task {
  fn lock(&self) -> MutexGuard<'_, TreeState> {
    self
      .shared
      .state
      .lock()
      .unwrap_or_else(|poison| poison.into_inner())
  }

  /// Creates a new task under this one and renders it.
  pub fn subtask(&self, name: impl Into<String>) -> Task {
    let mut state = self.lock();
    let id = state.nodes.len();
    state.nodes.push(Node::new(name.into()));
    state.nodes[self.id].subtasks.push(id);
    render(&mut state);
    Task {
      shared: self.shared.clone(),
      id,
    }
  }

  pub fn name(&self) -> String {
    self.lock().nodes[self.id].name.clone()
  }

  /// Applies a partial update and re-renders the tree.
  ///
  /// Panics when called on a finished task: finishing is the last
  /// mutation a task accepts.
  pub fn update(&self, update: Update) {
    let mut state = self.lock();
    self.apply(&mut state, update);
    render(&mut state);
  }

  /// Marks the task finished after applying a final update. The
  /// task can no longer be mutated afterwards.
  pub fn finish(&self, update: Update) {
    let mut state = self.lock();
    self.apply(&mut state, update);
    state.nodes[self.id].finished = true;
    render(&mut state);
  }

  fn apply(&self, state: &mut TreeState, update: Update) {
    let node = &mut state.nodes[self.id];
    if node.finished {
      panic!("cannot update finished task {}", node.name);
    }
    if let Some(status) = update.status {
      node.status = Some(status);
    }
    if let Some(flavor) = update.status_flavor {
      node.status_flavor = flavor;
    }
    if let Some(progress) = update.progress {
      node.progress = Some(progress);
    }
  }

  /// Appends one auxiliary line under the task.
  pub fn add_extra_info(&self, line: impl Into<String>) {
    let mut state = self.lock();
    state.nodes[self.id].extra_info.push(line.into());
    render(&mut state);
  }

  /// Replaces all auxiliary lines under the task.
  pub fn set_extra_info(&self, lines: Vec<String>) {
    let mut state = self.lock();
    state.nodes[self.id].extra_info = lines;
    render(&mut state);
  }

  /// Suspends rendering for the lifetime of the returned guard, so
  /// foreign output (an attached TTY, a raw pull stream) can share
  /// the terminal. Dropping the guard forces a full redraw. Nested
  /// pauses are fine; rendering resumes with the outermost drop.
  pub fn paused_output(&self) -> OutputPause {
    let mut state = self.lock();
    state.pause_depth += 1;
    OutputPause {
      shared: self.shared.clone(),
    }
  }

  /// Applies updates at most once per interval through a background
  /// flusher, for callers that produce updates faster than the
  /// terminal should repaint.
  pub fn rate_limited(
    &self,
    interval: std::time::Duration,
  ) -> RateLimitedUpdater {
    RateLimitedUpdater::new(self.clone(), interval)
  }
}

pub struct OutputPause {
  shared: Arc<Shared>,
}

impl Drop for OutputPause {
  fn drop(&mut self) {
    let mut state = self
      .shared
      .state
      .lock()
      .unwrap_or_else(|poison| poison.into_inner());
    state.pause_depth -= 1;
    if state.pause_depth == 0 {
      // Foreign output moved the cursor; start from a clean slate.
      state.cleared_lines = 0;
      render(&mut state);
    }
  }
}

/// Rows the subtree under `id` occupies: one per node plus its
/// extra info lines. The root sentinel contributes no line.
fn subtree_lines(nodes: &[Node], id: usize) -> usize {
  let node = &nodes[id];
  let own = if id == ROOT {
    0
  } else {
    1 + node.extra_info.len()
  };
  own
    + node
      .subtasks
      .iter()
      .map(|sub| subtree_lines(nodes, *sub))
      .sum::<usize>()
}

fn render(state: &mut TreeState) {
  if state.pause_depth > 0 {
    return;
  }
  let needed_lines = subtree_lines(&state.nodes, ROOT);
  // Scroll down for rows we have not claimed yet, or give back
  // rows we no longer need.
  if needed_lines > state.cleared_lines {
    let _ = write!(
      state.writer,
      "{}",
      "\n".repeat(needed_lines - state.cleared_lines)
    );
  } else if needed_lines < state.cleared_lines {
    let _ = write!(
      state.writer,
      "{}",
      format!("{UP_ONE}{CLEAR_LINE}")
        .repeat(state.cleared_lines - needed_lines)
    );
  }
  state.cleared_lines = needed_lines;
  // Move the cursor to the top of the claimed region.
  let _ = write!(
    state.writer,
    "{}",
    format!("{UP_ONE}{CLEAR_LINE}").repeat(needed_lines)
  );
  let width = terminal_width();
  let subtasks = state.nodes[ROOT].subtasks.clone();
  let mut out = Vec::new();
  for id in subtasks {
    print_node(&state.nodes, id, 0, width, &mut out);
  }
  let _ = state.writer.write_all(&out);
  let _ = state.writer.flush();
}

fn print_node(
  nodes: &[Node],
  id: usize,
  indent: usize,
  width: usize,
  out: &mut Vec<u8>,
) {
  let node = &nodes[id];
  let progress_string = match node.progress {
    Some((count, total)) => {
      format!(
        "{} ",
        make_progress_bar(count, total, PROGRESS_BAR_WIDTH)
      )
    }
    None => String::new(),
  };
  let status = node.status.as_deref().unwrap_or("");
  let status_string = match node.status_flavor {
    StatusFlavor::Bad => status.red().to_string(),
    StatusFlavor::Good => status.green().to_string(),
    StatusFlavor::Warning => status.yellow().to_string(),
    StatusFlavor::Neutral => status.to_string(),
  };
  let _ = writeln!(
    out,
    "{}{}: {}{}",
    INDENT.repeat(indent),
    node.name.cyan(),
    progress_string,
    status_string,
  );
  let info_indent = INDENT.repeat(indent + 1);
  for info in &node.extra_info {
    let max_chars = width.saturating_sub(info_indent.len() + 1);
    let info = info
      .chars()
      .filter(|c| *c != '\n')
      .take(max_chars)
      .collect::<String>();
    let _ = writeln!(out, "{info_indent}{info}");
  }
  for sub in &node.subtasks {
    print_node(nodes, *sub, indent + 1, width, out);
  }
}

fn terminal_width() -> usize {
  crossterm::terminal::size()
    .map(|(cols, _rows)| cols as usize)
    .unwrap_or(80)
}

/// `[===   ] count/total` with the bracketed section `width` chars
/// wide. The fill is `floor((width - 2) * count / total)` with the
/// ratio clamped to 0..=1.
pub fn make_progress_bar(
  count: u64,
  total: u64,
  width: usize,
) -> String {
  let ratio = if total == 0 {
    if count > 0 { 1.0 } else { 0.0 }
  } else {
    (count as f64 / total as f64).clamp(0.0, 1.0)
  };
  let bar_width = width.saturating_sub(2);
  let bar_size = (bar_width as f64 * ratio).floor() as usize;
  format!(
    "[{}{}] {}/{}",
    "=".repeat(bar_size),
    " ".repeat(bar_width - bar_size),
    count,
    total,
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Clone, Default)]
  struct SharedBuf(Arc<Mutex<Vec<u8>>>);

  impl SharedBuf {
    fn contents(&self) -> String {
      String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
  }

  impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
      self.0.lock().unwrap().extend_from_slice(buf);
      Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
      Ok(())
    }
  }

  fn tree_with_buf() -> (TaskTree, SharedBuf) {
    let buf = SharedBuf::default();
    let tree = TaskTree::with_writer(Box::new(buf.clone()));
    (tree, buf)
  }

  fn count_occurrences(haystack: &str, needle: &str) -> usize {
    haystack.matches(needle).count()
  }

  #[test]
  fn progress_bar_full_and_empty() {
    assert_eq!(
      make_progress_bar(0, 10, 12),
      "[          ] 0/10"
    );
    assert_eq!(
      make_progress_bar(10, 10, 12),
      "[==========] 10/10"
    );
  }

  #[test]
  fn progress_bar_partial_rounds_down() {
    // 28 * 0.5 = 14 filled at default width.
    let bar = make_progress_bar(1, 2, 30);
    assert!(bar.starts_with(&format!("[{}", "=".repeat(14))));
    assert!(bar.ends_with("] 1/2"));
    // 10 * 1/3 floors to 3.
    assert_eq!(make_progress_bar(1, 3, 12), "[===       ] 1/3");
  }

  #[test]
  fn progress_bar_clamps_overflow() {
    assert_eq!(make_progress_bar(15, 10, 12), "[==========] 15/10");
  }

  #[test]
  fn render_line_accounting() {
    let (tree, buf) = tree_with_buf();
    let root = tree.root();
    let a = root.subtask("a");
    let b = root.subtask("b");
    a.update(Update::status("working"));
    a.add_extra_info("detail one");
    a.add_extra_info("detail two");
    let c = b.subtask("c");
    c.update(Update::progress(3, 10));
    b.finish(Update::flavored("Done", StatusFlavor::Good));
    // Newlines emitted minus cursor-ups equals the rows the final
    // render occupies.
    let out = buf.contents();
    let newlines = count_occurrences(&out, "\n");
    let ups = count_occurrences(&out, UP_ONE);
    // a + 2 extra info + b + c
    assert_eq!(newlines - ups, 5);
  }

  #[test]
  fn render_shrinks_when_extra_info_replaced() {
    let (tree, buf) = tree_with_buf();
    let a = tree.root().subtask("a");
    a.set_extra_info(vec![
      String::from("one"),
      String::from("two"),
      String::from("three"),
    ]);
    a.set_extra_info(vec![String::from("one")]);
    let out = buf.contents();
    let newlines = count_occurrences(&out, "\n");
    let ups = count_occurrences(&out, UP_ONE);
    assert_eq!(newlines - ups, 2);
  }

  #[test]
  #[should_panic(expected = "finished task")]
  fn update_after_finish_panics() {
    let (tree, _buf) = tree_with_buf();
    let task = tree.root().subtask("done");
    task.finish(Update::status("Done"));
    task.update(Update::status("more"));
  }

  #[test]
  fn paused_output_suspends_rendering() {
    let (tree, buf) = tree_with_buf();
    let task = tree.root().subtask("a");
    let before = buf.contents().len();
    {
      let _pause = task.paused_output();
      task.update(Update::status("hidden"));
      assert_eq!(buf.contents().len(), before);
    }
    // Drop forces a full redraw including the queued status.
    let after = buf.contents();
    assert!(after.len() > before);
    assert!(after.contains("hidden"));
  }

  #[test]
  fn subtasks_render_indented() {
    let (tree, buf) = tree_with_buf();
    let parent = tree.root().subtask("parent");
    parent.subtask("child");
    let out = buf.contents();
    let last_render =
      out.rsplit(CLEAR_LINE).next().unwrap_or(&out);
    assert!(last_render.contains("  "));
  }
}
