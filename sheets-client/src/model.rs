//! In-memory document model.
//!
//! [`Model`] is the plain state; [`SharedModel`] is the handle every
//! collaborator holds. Files change only through [`SharedModel::apply_command`],
//! and every state change is followed by a call to the installed renderer.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use shared_types::Command;

use crate::activity::Direction;
use crate::error::ClientError;
use crate::timer::OneShotTimer;

/// Static-analysis snapshot, tied to the content it was computed from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisSnapshot {
    pub content: String,
    pub properties: serde_json::Value,
}

/// Last execution result, tagged with the content that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputSnapshot {
    pub content: String,
    pub emitted: serde_json::Value,
    pub output: Option<String>,
    pub defines: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct File {
    pub content: String,
    pub external_edit: bool,
    pub is_executing: bool,
    pub analysis: Option<AnalysisSnapshot>,
    pub output: Option<OutputSnapshot>,
}

impl File {
    /// The output was produced from content other than what the file holds now.
    pub fn output_is_stale(&self) -> bool {
        self.output
            .as_ref()
            .is_some_and(|output| output.content != self.content)
    }

    pub fn analysis_is_stale(&self) -> bool {
        self.analysis
            .as_ref()
            .is_some_and(|analysis| analysis.content != self.content)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Model {
    files: BTreeMap<String, File>,
    pub show_navigation: bool,
    pub show_help: bool,
    pub focus_name: Option<String>,
    pub connection_live: bool,
    pub connection_direction: Option<Direction>,
}

impl Model {
    pub fn files(&self) -> &BTreeMap<String, File> {
        &self.files
    }

    pub fn file(&self, name: &str) -> Option<&File> {
        self.files.get(name)
    }

    /// File names in sorted order.
    pub fn file_names(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    /// Apply one command. Never fails: commands for missing files are dropped.
    pub fn apply_command(&mut self, command: &Command) {
        match command {
            Command::FileEdit(edit) => {
                let file = self.files.entry(edit.filename.clone()).or_default();
                file.content = edit.content.clone();
                file.external_edit = edit.external_edit;
            }
            Command::FileDelete(delete) => {
                if self.files.remove(&delete.filename).is_none() {
                    tracing::debug!(filename = %delete.filename, "Delete of unknown file ignored");
                }
            }
            Command::ExecutionRequest(request) => {
                let file = self.files.entry(request.filename.clone()).or_default();
                file.is_executing = true;
            }
            Command::Analysis(analysis) => {
                let Some(file) = self.files.get_mut(&analysis.filename) else {
                    tracing::warn!(
                        filename = %analysis.filename,
                        "Got analysis for file that doesn't exist"
                    );
                    return;
                };
                file.analysis = Some(AnalysisSnapshot {
                    content: analysis.content.clone(),
                    properties: analysis.properties.clone(),
                });
            }
            Command::Execution(execution) => {
                let Some(file) = self.files.get_mut(&execution.filename) else {
                    tracing::debug!(
                        filename = %execution.filename,
                        "Dropping execution result for missing file"
                    );
                    return;
                };
                file.output = Some(OutputSnapshot {
                    content: execution.content.clone(),
                    emitted: execution.emitted.clone(),
                    output: execution.output.clone(),
                    defines: execution.defines.clone(),
                });
                file.is_executing = false;
            }
        }
    }
}

/// Hook installed by the rendering layer, called after every state change.
pub type Renderer = Arc<dyn Fn() + Send + Sync>;

pub const DEFAULT_DIRECTION_RESET: Duration = Duration::from_millis(1000);

struct State {
    model: Model,
    /// Bumped on every direction change so a late reset cannot clobber a newer one.
    direction_epoch: u64,
}

struct Inner {
    state: Mutex<State>,
    renderer: Mutex<Option<Renderer>>,
    direction_timer: OneShotTimer,
    direction_reset: Duration,
}

/// Cloneable handle to the single document model of a session.
#[derive(Clone)]
pub struct SharedModel {
    inner: Arc<Inner>,
}

impl Default for SharedModel {
    fn default() -> Self {
        Self::new(DEFAULT_DIRECTION_RESET)
    }
}

impl std::fmt::Debug for SharedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedModel")
            .field("model", &self.state().model)
            .finish_non_exhaustive()
    }
}

impl SharedModel {
    pub fn new(direction_reset: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    model: Model::default(),
                    direction_epoch: 0,
                }),
                renderer: Mutex::new(None),
                direction_timer: OneShotTimer::new(),
                direction_reset,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_renderer<F>(&self, renderer: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self
            .inner
            .renderer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(renderer));
    }

    pub fn clear_renderer(&self) {
        self.inner
            .renderer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Invoke the renderer, if one is installed.
    pub fn render(&self) {
        let renderer = self
            .inner
            .renderer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(renderer) = renderer {
            renderer();
        }
    }

    /// The only way files change.
    pub fn apply_command(&self, command: &Command) {
        self.state().model.apply_command(command);
        self.render();
    }

    /// Record traffic in `direction`; a non-empty direction resets itself
    /// after the configured window, and each call restarts that window.
    pub fn set_connection_direction(&self, direction: Option<Direction>) {
        self.inner.direction_timer.cancel();
        let epoch = {
            let mut state = self.state();
            state.direction_epoch += 1;
            state.model.connection_direction = direction;
            state.direction_epoch
        };

        if direction.is_some() {
            let weak = Arc::downgrade(&self.inner);
            self.inner
                .direction_timer
                .arm(self.inner.direction_reset, move || expire_direction(weak, epoch));
        }
        self.render();
    }

    /// String form of [`Self::set_connection_direction`] for untyped callers.
    pub fn set_connection_direction_str(&self, direction: Option<&str>) -> Result<(), ClientError> {
        let direction = Direction::parse_optional(direction)?;
        self.set_connection_direction(direction);
        Ok(())
    }

    /// True while a direction reset is scheduled.
    pub fn direction_reset_pending(&self) -> bool {
        self.inner.direction_timer.is_armed()
    }

    pub fn set_connection_live(&self, live: bool) {
        self.state().model.connection_live = live;
        self.render();
    }

    pub fn toggle_navigation(&self) {
        {
            let mut state = self.state();
            state.model.show_navigation = !state.model.show_navigation;
        }
        self.render();
    }

    pub fn close_navigation(&self) {
        self.state().model.show_navigation = false;
        self.render();
    }

    pub fn toggle_help(&self) {
        {
            let mut state = self.state();
            state.model.show_help = !state.model.show_help;
        }
        self.render();
    }

    /// Remember which file has keyboard focus. Does not render.
    pub fn set_focus(&self, name: Option<String>) {
        self.state().model.focus_name = name;
    }

    /// Run `f` against the current state.
    pub fn read<R>(&self, f: impl FnOnce(&Model) -> R) -> R {
        f(&self.state().model)
    }

    pub fn snapshot(&self) -> Model {
        self.state().model.clone()
    }

    pub fn file(&self, name: &str) -> Option<File> {
        self.read(|model| model.file(name).cloned())
    }

    pub fn connection_direction(&self) -> Option<Direction> {
        self.read(|model| model.connection_direction)
    }

    pub fn connection_live(&self) -> bool {
        self.read(|model| model.connection_live)
    }
}

fn expire_direction(inner: Weak<Inner>, epoch: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let model = SharedModel { inner };
    {
        let mut state = model.state();
        if state.direction_epoch != epoch {
            return;
        }
        state.model.connection_direction = None;
    }
    model.render();
}
