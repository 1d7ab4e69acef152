//! Interactive console state: the control surface, the picker and the catalog
//! lookups the operator started. Lookups run as background tasks so channel events and
//! command settlements keep flowing while the backend answers.

use crate::catalog::{CatalogClient, Picker, DEFAULT_IDS_LIMIT, DEFAULT_SEARCH_LIMIT};
use crate::channel::{ChannelEvent, ChannelState};
use crate::console::{self, ConsoleCommand, HELP};
use crate::gateway::{CommandDispatch, CommandGateway};
use crate::surface::{CommandOutcome, ControlSurface};
use opsdeck_core::{
    command::DispatchError, AgentCommand, Resource, ResourceId, SaveSelectionAck,
};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, warn};

/// A settled catalog request, tagged with what the operator asked for.
#[derive(Debug)]
pub enum Lookup {
    Search(Result<Vec<Resource>, DispatchError>),
    Select {
        requested: usize,
        result: Result<Vec<Resource>, DispatchError>,
    },
    Toggle {
        id: ResourceId,
        result: Result<Vec<Resource>, DispatchError>,
    },
    Save(Result<SaveSelectionAck, DispatchError>),
}

pub struct ConsoleSession<D: CommandDispatch = CommandGateway> {
    surface: ControlSurface<D>,
    picker: Picker,
    catalog: CatalogClient,
    lookups: JoinSet<Lookup>,
}

impl<D: CommandDispatch> ConsoleSession<D> {
    pub fn new(surface: ControlSurface<D>, catalog: CatalogClient) -> Self {
        let picker = Picker::new(surface.selection().items());
        Self {
            surface,
            picker,
            catalog,
            lookups: JoinSet::new(),
        }
    }

    pub fn surface(&self) -> &ControlSurface<D> {
        &self.surface
    }

    pub fn selection_lines(&self) -> Vec<String> {
        console::selection_lines(self.surface.selection().items())
    }

    /// Run one operator command. Anything that needs the backend catalog is started in
    /// the background and reported by [`settle_lookup`](Self::settle_lookup).
    pub fn handle(&mut self, command: ConsoleCommand) -> Vec<String> {
        match command {
            ConsoleCommand::Start => match self.surface.request_start() {
                Ok(()) => vec!["start_script dispatched".to_string()],
                Err(blocker) => vec![format!("start unavailable: {blocker}")],
            },
            ConsoleCommand::Status => {
                let mut lines = vec![self.agent_line()];
                lines.extend(self.selection_lines());
                lines.push(match self.surface.in_flight() {
                    Some(command) => format!("in flight: {command}"),
                    None => format!("start: {}", self.surface.start_hint()),
                });
                if !self.lookups.is_empty() {
                    lines.push(format!("catalog lookups pending: {}", self.lookups.len()));
                }
                lines
            }
            ConsoleCommand::Log(count) => {
                if self.surface.log().is_empty() {
                    return vec!["no status events yet".to_string()];
                }
                self.surface
                    .log()
                    .iter()
                    .take(count)
                    .map(console::log_line)
                    .collect()
            }
            ConsoleCommand::Search(query) => {
                let catalog = self.catalog.clone();
                self.lookups.spawn(async move {
                    Lookup::Search(catalog.search(&query, DEFAULT_SEARCH_LIMIT).await)
                });
                Vec::new()
            }
            ConsoleCommand::Select(ids) => {
                let catalog = self.catalog.clone();
                self.lookups.spawn(async move {
                    Lookup::Select {
                        requested: ids.len(),
                        result: catalog.by_ids(&ids, DEFAULT_IDS_LIMIT).await,
                    }
                });
                Vec::new()
            }
            ConsoleCommand::Toggle(id) => {
                if self.picker.is_selected(id) {
                    let items = self.picker.remove(id);
                    return self.apply_selection(items);
                }
                let catalog = self.catalog.clone();
                self.lookups.spawn(async move {
                    Lookup::Toggle {
                        id,
                        result: catalog.by_ids(&[id], DEFAULT_IDS_LIMIT).await,
                    }
                });
                Vec::new()
            }
            ConsoleCommand::Save => {
                let catalog = self.catalog.clone();
                let ids = self.surface.selection().ids();
                self.lookups
                    .spawn(async move { Lookup::Save(catalog.save_selection(&ids).await) });
                Vec::new()
            }
            ConsoleCommand::Cmd { name, args } => {
                let command = AgentCommand::Custom {
                    name: name.clone(),
                    args,
                };
                match self.surface.run_command(command) {
                    Ok(()) => vec![format!("{name} dispatched")],
                    Err(blocker) => vec![format!("{name} unavailable: {blocker}")],
                }
            }
            ConsoleCommand::Help => vec![HELP.to_string()],
            ConsoleCommand::Quit => Vec::new(),
        }
    }

    /// Fold a channel event into the surface. Opening and the first close of a run are
    /// announced, as is any change of the agent indicator.
    pub fn apply_event(&mut self, event: &ChannelEvent) -> Vec<String> {
        let previous = self.surface.channel_state();
        let changed = self.surface.apply_channel_event(event);
        let announce = match event {
            ChannelEvent::Opened => true,
            ChannelEvent::Closed(_) => !matches!(previous, ChannelState::Closed { .. }),
            ChannelEvent::Frame(_) => false,
        };
        let mut lines = Vec::new();
        if announce {
            lines.push(console::event_line(event));
        }
        if changed || announce {
            lines.push(self.agent_line());
        }
        lines
    }

    /// The channel task is gone and will not reconnect.
    pub fn channel_ended(&mut self) -> Vec<String> {
        self.surface
            .set_channel_state(ChannelState::Closed { retryable: false });
        vec![self.agent_line()]
    }

    pub fn has_lookups(&self) -> bool {
        !self.lookups.is_empty()
    }

    pub async fn next_lookup(&mut self) -> Option<Result<Lookup, JoinError>> {
        self.lookups.join_next().await
    }

    pub fn settle_lookup(&mut self, settled: Result<Lookup, JoinError>) -> Vec<String> {
        let lookup = match settled {
            Ok(lookup) => lookup,
            Err(err) => {
                warn!(event = "catalog_lookup_task_failed", error = %err);
                return vec![format!("catalog lookup failed: {err}")];
            }
        };
        match lookup {
            Lookup::Search(Ok(items)) if items.is_empty() => {
                vec!["no resources found".to_string()]
            }
            Lookup::Search(Ok(items)) => items
                .iter()
                .map(|item| {
                    let mark = if self.picker.is_selected(item.id) {
                        "[x]"
                    } else {
                        "[ ]"
                    };
                    format!("{mark} {item}")
                })
                .collect(),
            Lookup::Search(Err(err)) => vec![format!("search failed: {err}")],
            Lookup::Select {
                requested,
                result: Ok(items),
            } => {
                let mut lines = Vec::new();
                let missing = requested.saturating_sub(items.len());
                if missing > 0 {
                    lines.push(format!("{missing} id(s) not found"));
                }
                self.picker = Picker::new(&items);
                lines.extend(self.apply_selection(items));
                lines
            }
            Lookup::Select { result: Err(err), .. } => vec![format!("lookup failed: {err}")],
            Lookup::Toggle {
                id,
                result: Ok(mut found),
            } => {
                if found.is_empty() {
                    return vec![format!("resource {id} not found")];
                }
                let items = self.picker.insert(found.remove(0));
                self.apply_selection(items)
            }
            Lookup::Toggle { result: Err(err), .. } => vec![format!("lookup failed: {err}")],
            Lookup::Save(Ok(ack)) if ack.ok => {
                vec![format!("selection saved ({} item(s))", ack.count)]
            }
            Lookup::Save(Ok(_)) => vec!["selection save was not acknowledged".to_string()],
            Lookup::Save(Err(err)) => vec![format!("save failed: {err}")],
        }
    }

    pub fn has_pending(&self) -> bool {
        self.surface.has_pending()
    }

    pub async fn next_settlement(&mut self) -> Option<Result<CommandOutcome, JoinError>> {
        self.surface.next_settlement().await
    }

    pub fn settle_command(&mut self, settled: Result<CommandOutcome, JoinError>) -> String {
        console::notice_line(self.surface.settle(settled))
    }

    fn apply_selection(&mut self, items: Vec<Resource>) -> Vec<String> {
        self.surface.replace_selection(items);
        debug!(event = "selection_applied", items = self.surface.selection().len());
        self.selection_lines()
    }

    fn agent_line(&self) -> String {
        console::agent_line(self.surface.agent_connected(), self.surface.channel_state())
    }
}
