//! Editor actions: the operations the rendering layer triggers.
//!
//! A [`Notebook`] wires one [`SharedModel`] to one [`Transport`] and turns user
//! intents (typing, running, deleting) into commands.

use shared_types::{Command, ExecutionRequest, FileDelete, FileEdit};
use tracing::{info, warn};

use crate::config::Config;
use crate::debounce::EditDebouncer;
use crate::error::ClientError;
use crate::model::SharedModel;
use crate::transport::{ConnectionStatus, SubscriptionId, Transport};

pub struct Notebook {
    model: SharedModel,
    transport: Transport,
    edits: EditDebouncer,
    status_subscription: SubscriptionId,
}

impl Notebook {
    /// Build the model and transport. Nothing connects until [`Notebook::open`].
    pub fn new(config: &Config) -> Self {
        let model = SharedModel::new(config.direction_reset);
        let transport = Transport::with_connect_timeout(
            config.server_url.clone(),
            config.reconnect_delay,
            config.connect_timeout,
            model.clone(),
        );

        let live_model = model.clone();
        let status_subscription = transport.subscribe(move |status| {
            live_model.set_connection_live(status == ConnectionStatus::Opened);
        });

        let sender = transport.clone();
        let edits = EditDebouncer::new(config.edit_debounce, move |filename, content| {
            if let Err(e) = sender.send(file_edit(filename, content)) {
                warn!(filename, error = %e, "Debounced edit not delivered");
            }
        });

        Self {
            model,
            transport,
            edits,
            status_subscription,
        }
    }

    pub fn open(&self) {
        info!(url = %self.transport.url(), "Opening notebook connection");
        self.transport.open();
    }

    pub fn shutdown(&self) {
        self.edits.flush_all();
        self.transport.shutdown();
    }

    pub fn model(&self) -> &SharedModel {
        &self.model
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Send the full content of a file right away.
    pub fn update_file(&self, filename: &str, content: &str) -> Result<(), ClientError> {
        self.edits.discard(filename);
        self.transport
            .send(file_edit(filename, content.to_string()))
    }

    /// Create an empty file.
    pub fn add_file(&self, filename: &str) -> Result<(), ClientError> {
        self.update_file(filename, "")
    }

    /// Record typing in `filename`; the edit is sent once the burst settles.
    pub fn type_into(&self, filename: &str, content: &str) {
        self.edits.push(filename, content.to_string());
    }

    /// Send any edits still waiting on the debounce window.
    pub fn flush_edits(&self) {
        self.edits.flush_all();
    }

    /// Delete `filename` if `confirm` agrees. Returns whether a delete was sent.
    pub fn delete_file<F>(&self, filename: &str, confirm: F) -> Result<bool, ClientError>
    where
        F: FnOnce(&str) -> bool,
    {
        if !confirm(filename) {
            return Ok(false);
        }
        self.edits.discard(filename);
        self.transport.send(
            FileDelete {
                filename: filename.to_string(),
                external_edit: false,
            }
            .into(),
        )?;
        Ok(true)
    }

    /// Ask the backend to run the current content of `filename`.
    pub fn execute_file(&self, filename: &str, subexpressions: bool) -> Result<(), ClientError> {
        self.edits.flush(filename);
        let content = self
            .model
            .file(filename)
            .map(|file| file.content)
            .unwrap_or_default();
        self.transport.send(
            ExecutionRequest {
                filename: filename.to_string(),
                content,
                subexpressions,
            }
            .into(),
        )
    }

    /// Run every file in name order. Every file is attempted; the first
    /// failure, if any, is returned.
    pub fn run_all(&self) -> Result<usize, ClientError> {
        let names = self.model.read(|model| model.file_names());
        let mut first_error = None;
        for name in &names {
            if let Err(e) = self.execute_file(name, false) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(names.len()),
        }
    }

    /// Sorted file names containing `filter`.
    pub fn navigation_candidates(&self, filter: &str) -> Vec<String> {
        self.model.read(|model| {
            model
                .file_names()
                .into_iter()
                .filter(|name| filter.is_empty() || name.contains(filter))
                .collect()
        })
    }

    /// Focus the `index`th navigation candidate (clamped to the last one) and
    /// close the navigator.
    pub fn select_navigation(&self, filter: &str, index: usize) -> Option<String> {
        let candidates = self.navigation_candidates(filter);
        let selected = candidates
            .get(index.min(candidates.len().saturating_sub(1)))
            .cloned()?;
        self.model.set_focus(Some(selected.clone()));
        self.model.close_navigation();
        Some(selected)
    }
}

impl Drop for Notebook {
    fn drop(&mut self) {
        self.transport.unsubscribe(self.status_subscription);
        self.transport.shutdown();
    }
}

fn file_edit(filename: &str, content: String) -> Command {
    FileEdit {
        filename: filename.to_string(),
        content,
        external_edit: false,
    }
    .into()
}
