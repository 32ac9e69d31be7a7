use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;

use crate::agent::AgentState;
use crate::config::PathsConfig;
use crate::logging::{LogLevel, Logger};
use crate::wire::codec::{ActionCode, Response};

const LOG_CONTEXT: &str = "dispatch::agent";

/// Maps a decoded action from a control session to the response written
/// back to that session, if any.
pub trait Dispatcher: Send + Sync {
    fn dispatch(
        &self,
        connection_id: u64,
        action: ActionCode,
        payload: &[u8],
    ) -> Option<Response>;
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Artifact {
    AsBuilt,
    Configuration,
    Ofs,
}

impl Artifact {
    pub fn name(self) -> &'static str {
        match self {
            Self::AsBuilt => "as-built",
            Self::Configuration => "configuration",
            Self::Ofs => "ofs",
        }
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug)]
pub enum ArtifactError {
    NotConfigured { artifact: Artifact },
    Read { path: PathBuf, source: io::Error },
}

impl fmt::Display for ArtifactError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConfigured { artifact } => {
                write!(f, "no location configured for {artifact} artifact")
            }
            Self::Read { path, source } => {
                write!(f, "failed to read '{}': {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ArtifactError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Read { source, .. } => Some(source),
            Self::NotConfigured { .. } => None,
        }
    }
}

pub trait ArtifactStore: Send + Sync {
    fn location(&self, artifact: Artifact) -> Option<&Path>;

    fn read(&self, artifact: Artifact) -> Result<Vec<u8>, ArtifactError> {
        let path = self
            .location(artifact)
            .ok_or(ArtifactError::NotConfigured { artifact })?;
        fs::read(path).map_err(|source| ArtifactError::Read {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Artifact locations taken from the `[paths]` configuration section. Empty
/// entries count as not configured.
#[derive(Clone, Debug, Default)]
pub struct FsArtifactStore {
    as_built: Option<PathBuf>,
    configuration: Option<PathBuf>,
    ofs: Option<PathBuf>,
}

impl FsArtifactStore {
    pub fn from_paths_config(paths: &PathsConfig) -> Self {
        Self {
            as_built: non_empty_path(&paths.as_built_location),
            configuration: non_empty_path(&paths.config_location),
            ofs: non_empty_path(&paths.ofs_location),
        }
    }
}

impl ArtifactStore for FsArtifactStore {
    fn location(&self, artifact: Artifact) -> Option<&Path> {
        match artifact {
            Artifact::AsBuilt => self.as_built.as_deref(),
            Artifact::Configuration => self.configuration.as_deref(),
            Artifact::Ofs => self.ofs.as_deref(),
        }
    }
}

fn non_empty_path(value: &str) -> Option<PathBuf> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
}

pub struct AgentDispatcher {
    state: Arc<AgentState>,
    store: Arc<dyn ArtifactStore>,
    logger: Arc<Logger>,
}

impl AgentDispatcher {
    pub fn new(
        state: Arc<AgentState>,
        store: Arc<dyn ArtifactStore>,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            state,
            store,
            logger,
        }
    }

    fn serve_artifact(
        &self,
        connection_id: u64,
        action: ActionCode,
        artifact: Artifact,
    ) -> Response {
        match self.store.read(artifact) {
            Ok(data) => {
                self.logger.log(
                    LogLevel::Debug,
                    Some(LOG_CONTEXT),
                    "Serving artifact",
                    Some(json!({
                        "connection_id": connection_id,
                        "artifact": artifact.name(),
                        "bytes": data.len(),
                    })),
                );
                Response::success(action, data)
            }
            Err(error) => {
                self.logger.warn(
                    Some(LOG_CONTEXT),
                    &format!("{action} for connection {connection_id} failed: {error}"),
                );
                Response::fail(action)
            }
        }
    }

    fn update_ofs(&self, connection_id: u64) -> Response {
        let Some(_update) = self.state.try_begin_update() else {
            self.logger.warn(
                Some(LOG_CONTEXT),
                &format!(
                    "Rejected UPDATE_OFS from connection {connection_id}: \
                     update already in progress"
                ),
            );
            return Response::fail(ActionCode::UpdateOfs);
        };

        let target = self
            .store
            .location(Artifact::Ofs)
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<unset>".to_owned());
        self.logger.warn(
            Some(LOG_CONTEXT),
            &format!(
                "UPDATE_OFS from connection {connection_id} not supported: \
                 no transfer framing for target {target}"
            ),
        );
        Response::fail(ActionCode::UpdateOfs)
    }
}

impl Dispatcher for AgentDispatcher {
    fn dispatch(&self, connection_id: u64, action: ActionCode, payload: &[u8]) -> Option<Response> {
        self.logger.log(
            LogLevel::Verbose,
            Some(LOG_CONTEXT),
            "Dispatching action",
            Some(json!({
                "connection_id": connection_id,
                "action": action.name(),
                "payload_bytes": payload.len(),
            })),
        );

        match action {
            ActionCode::Close => {
                self.state.request_close();
                self.logger.info(
                    Some(LOG_CONTEXT),
                    &format!("Close requested by connection {connection_id}"),
                );
                None
            }
            ActionCode::BootInterrupt => Some(Response::success(action, Vec::new())),
            ActionCode::GetAsBuilt => {
                Some(self.serve_artifact(connection_id, action, Artifact::AsBuilt))
            }
            ActionCode::UpdateConfig => {
                Some(self.serve_artifact(connection_id, action, Artifact::Configuration))
            }
            ActionCode::UpdateOfs => Some(self.update_ofs(connection_id)),
            ActionCode::GetLogNames | ActionCode::GetSpecificLog | ActionCode::GetLastFlightLog => {
                self.logger.warn(
                    Some(LOG_CONTEXT),
                    &format!("{action} from connection {connection_id} is not implemented"),
                );
                Some(Response::fail(action))
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::testing::MemoryArtifactStore;
    use super::{
        AgentDispatcher, Artifact, ArtifactError, ArtifactStore, Dispatcher, FsArtifactStore,
    };
    use crate::agent::AgentState;
    use crate::config::PathsConfig;
    use crate::logging::testing::{memory_logger, MemorySink};
    use crate::wire::codec::{ActionCode, ActionStatus, Response};

    fn dispatcher(
        store: MemoryArtifactStore,
    ) -> (AgentDispatcher, Arc<AgentState>, Arc<MemorySink>) {
        let (logger, sink) = memory_logger();
        let state = Arc::new(AgentState::new());
        (
            AgentDispatcher::new(Arc::clone(&state), Arc::new(store), logger),
            state,
            sink,
        )
    }

    fn temp_dir(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after epoch")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("unit-updater-{label}-{nanos}"));
        fs::create_dir_all(&dir).expect("temp dir should be created");
        dir
    }

    #[test]
    fn close_sets_flag_without_response() {
        let (dispatcher, state, _sink) = dispatcher(MemoryArtifactStore::default());

        assert_eq!(dispatcher.dispatch(1, ActionCode::Close, &[]), None);
        assert!(state.is_close_requested());
    }

    #[test]
    fn boot_interrupt_over_control_session_is_a_liveness_check() {
        let (dispatcher, state, _sink) = dispatcher(MemoryArtifactStore::default());

        assert_eq!(
            dispatcher.dispatch(1, ActionCode::BootInterrupt, &[]),
            Some(Response::success(ActionCode::BootInterrupt, Vec::new()))
        );
        assert!(!state.is_close_requested());
    }

    #[test]
    fn artifacts_are_served_or_fail() {
        let store = MemoryArtifactStore::default().with(Artifact::AsBuilt, b"unit 42 rev C");
        let (dispatcher, _state, sink) = dispatcher(store);

        assert_eq!(
            dispatcher.dispatch(3, ActionCode::GetAsBuilt, &[]),
            Some(Response::success(ActionCode::GetAsBuilt, b"unit 42 rev C".to_vec()))
        );
        assert_eq!(
            dispatcher.dispatch(3, ActionCode::UpdateConfig, &[]),
            Some(Response::fail(ActionCode::UpdateConfig))
        );
        assert!(sink.contains("UPDATE_CONFIG for connection 3 failed"));
    }

    #[test]
    fn log_actions_fail_as_not_implemented() {
        let (dispatcher, _state, sink) = dispatcher(MemoryArtifactStore::default());

        for action in [
            ActionCode::GetLogNames,
            ActionCode::GetSpecificLog,
            ActionCode::GetLastFlightLog,
        ] {
            let response = dispatcher
                .dispatch(9, action, &[])
                .expect("log actions should answer");
            assert_eq!(response.action, action);
            assert_eq!(response.status, ActionStatus::Fail);
            assert!(response.data.is_empty());
        }
        assert!(sink.contains("GET_LAST_FLIGHT_LOG from connection 9 is not implemented"));
    }

    #[test]
    fn update_ofs_fails_and_releases_flag() {
        let (dispatcher, state, _sink) = dispatcher(MemoryArtifactStore::default());

        assert_eq!(
            dispatcher.dispatch(2, ActionCode::UpdateOfs, &[]),
            Some(Response::fail(ActionCode::UpdateOfs))
        );
        assert!(!state.is_update_in_progress());
    }

    #[test]
    fn update_ofs_is_rejected_while_another_update_runs() {
        let (dispatcher, state, sink) = dispatcher(MemoryArtifactStore::default());
        let _running = state.try_begin_update().expect("first update should start");

        assert_eq!(
            dispatcher.dispatch(2, ActionCode::UpdateOfs, &[]),
            Some(Response::fail(ActionCode::UpdateOfs))
        );
        assert!(sink.contains("update already in progress"));
        assert!(state.is_update_in_progress());
    }

    #[test]
    fn fs_store_reads_configured_paths() {
        let dir = temp_dir("artifacts");
        let as_built = dir.join("as_built.json");
        fs::write(&as_built, b"{\"serial\":\"A1\"}").expect("fixture should be written");

        let store = FsArtifactStore::from_paths_config(&PathsConfig {
            as_built_location: as_built.display().to_string(),
            config_location: "   ".to_owned(),
            ofs_location: dir.join("ofs.bin").display().to_string(),
            sdcard_location: dir.join("sdcard.img").display().to_string(),
        });

        assert_eq!(
            store.read(Artifact::AsBuilt).expect("as-built should read"),
            b"{\"serial\":\"A1\"}"
        );
        assert!(matches!(
            store.read(Artifact::Configuration),
            Err(ArtifactError::NotConfigured {
                artifact: Artifact::Configuration
            })
        ));
        assert!(matches!(
            store.read(Artifact::Ofs),
            Err(ArtifactError::Read { .. })
        ));
        assert_eq!(
            store.location(Artifact::Ofs),
            Some(dir.join("ofs.bin").as_path())
        );

        fs::remove_dir_all(dir).expect("temp dir should be removed");
    }
}
