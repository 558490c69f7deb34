use std::sync::Arc;

use hadir_core::Descriptor;
use tokio::sync::watch;
use zbus::interface;

use crate::config::Config;
use crate::status::StatusSnapshot;
use crate::store::AttendanceDb;

pub const BUS_NAME: &str = "org.hadir.Attendance1";
pub const OBJECT_PATH: &str = "/org/hadir/Attendance1";

/// Shared state accessible by D-Bus method handlers.
pub struct AppState {
    pub config: Config,
    pub store: AttendanceDb,
    pub status: watch::Receiver<StatusSnapshot>,
}

/// D-Bus interface for the Hadir attendance daemon.
///
/// Bus name: org.hadir.Attendance1
/// Object path: /org/hadir/Attendance1
pub struct AttendanceService {
    pub state: Arc<AppState>,
}

/// Retrieve the UID of the D-Bus peer identified by `sender_str` (a unique bus name).
async fn get_caller_uid(sender_str: &str, conn: &zbus::Connection) -> zbus::fdo::Result<u32> {
    let dbus_proxy = zbus::fdo::DBusProxy::new(conn)
        .await
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
    let bus_name = zbus::names::BusName::try_from(sender_str)
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
    dbus_proxy
        .get_connection_unix_user(bus_name)
        .await
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

impl AttendanceService {
    /// Enrollment changes are root-only on the system bus.
    async fn require_root(
        &self,
        method: &str,
        header: &zbus::message::Header<'_>,
        conn: &zbus::Connection,
    ) -> zbus::fdo::Result<()> {
        if self.state.config.session_bus {
            return Ok(());
        }
        let sender = header
            .sender()
            .ok_or_else(|| zbus::fdo::Error::Failed("no sender in message".to_string()))?;
        let caller_uid = get_caller_uid(sender.as_str(), conn).await?;
        if caller_uid != 0 {
            tracing::warn!(method, caller_uid, "rejected non-root caller");
            return Err(zbus::fdo::Error::AccessDenied(format!(
                "{method} requires root"
            )));
        }
        Ok(())
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.hadir.Attendance1")]
impl AttendanceService {
    /// Enroll a person with a precomputed face descriptor (JSON array of 128 floats).
    ///
    /// Returns the UUID of the new user.
    async fn register(
        &self,
        label: &str,
        name: &str,
        descriptor_json: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(label, name, "register requested");
        self.require_root("Register", &header, conn).await?;

        let descriptor = Descriptor::from_json(descriptor_json).map_err(|e| {
            tracing::warn!(error = %e, "register: invalid descriptor");
            zbus::fdo::Error::InvalidArgs(e.to_string())
        })?;

        let id = self
            .state
            .store
            .register(label, name, &descriptor)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "register: store insert failed");
                zbus::fdo::Error::Failed(e.to_string())
            })?;

        tracing::info!(id = %id, label, "registered successfully");
        Ok(id)
    }

    /// Remove a registered user by ID. Attendance history is kept.
    async fn remove_user(
        &self,
        id: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<bool> {
        tracing::info!(id, "remove_user requested");
        self.require_root("RemoveUser", &header, conn).await?;

        let removed = self
            .state
            .store
            .remove_user(id)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        if removed {
            tracing::info!(id, "user removed");
        } else {
            tracing::warn!(id, "user not found");
        }
        Ok(removed)
    }

    /// List registered users as JSON.
    async fn list_users(&self) -> zbus::fdo::Result<String> {
        let users = self
            .state
            .store
            .list_users()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        to_json(&users)
    }

    /// Attendance history for one label as JSON, newest first.
    async fn history(&self, label: &str) -> zbus::fdo::Result<String> {
        tracing::info!(label, "history requested");
        let history = self
            .state
            .store
            .history(label)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        to_json(&history)
    }

    /// Aggregate attendance statistics as JSON.
    async fn stats(&self) -> zbus::fdo::Result<String> {
        let stats = self
            .state
            .store
            .stats()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        to_json(&stats)
    }

    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let users_enrolled = match self.state.store.count_users().await {
            Ok(count) => Some(count),
            Err(e) => {
                tracing::warn!(error = %e, "status: failed to count users");
                None
            }
        };
        let snapshot = self.state.status.borrow().clone();
        Ok(status_report(&self.state.config, &snapshot, users_enrolled).to_string())
    }
}

/// `users_enrolled` is `null` when the store could not be queried.
fn status_report(
    config: &Config,
    snapshot: &StatusSnapshot,
    users_enrolled: Option<u64>,
) -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "state": snapshot.state,
        "render": snapshot.render,
        "sessions_completed": snapshot.sessions_completed,
        "last_commit": snapshot.last_commit,
        "users_enrolled": users_enrolled,
        "detector_source": config.detector_source,
        "session_bus": config.session_bus,
    })
}
