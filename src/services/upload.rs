//! Program file operations on the device, available while connected.

use crate::{
    ago_device_client::{DeviceClient, RemoteProgram, UploadOutcome, UploadRequest},
    model::{Recipe, new_id, timestamp},
    notice::{FailureKind, Notice, NoticeBus},
    recipe_store::{RecipeStore, UploadRecord},
    services::{
        connectivity::{ConnectionState, ConnectivityStatus},
        persistence::PersistenceEngine,
        program::{build_upload_payload, program_filename},
    },
};
use log::{debug, info, warn};
use tokio::sync::watch;

pub struct UploadService<S, D> {
    engine: PersistenceEngine<S>,
    device: D,
    status: watch::Receiver<ConnectivityStatus>,
    notices: NoticeBus,
}

impl<S, D> UploadService<S, D>
where
    S: RecipeStore + Send + Sync + 'static,
    D: DeviceClient,
{
    pub fn new(
        engine: PersistenceEngine<S>,
        device: D,
        status: watch::Receiver<ConnectivityStatus>,
        notices: NoticeBus,
    ) -> Self {
        Self {
            engine,
            device,
            status,
            notices,
        }
    }

    /// Device address if connected, otherwise tells the user to connect
    fn connected_ip(&self) -> Option<String> {
        if self.status.borrow().state != ConnectionState::Connected {
            debug!("device operation refused while not connected");
            self.notices.publish(Notice::failure(
                FailureKind::ConfigurationMissing,
                "Connect to AGO first",
            ));
            return None;
        }

        Some(self.engine.settings().device_address().ip)
    }

    /// Send a recipe to the device as a custom program and record it
    pub async fn upload(&self, recipe: &Recipe) -> Option<UploadOutcome> {
        let ip = self.connected_ip()?;
        let settings = self.engine.settings();

        let request = UploadRequest {
            endpoint: settings.upload_endpoint().to_string(),
            field_name: settings.upload_field().to_string(),
            filename: program_filename(recipe),
            payload: build_upload_payload(recipe),
        };

        let outcome = match self.device.upload_program(&ip, &request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.notices.publish(Notice::failure(
                    FailureKind::DeviceCommand,
                    format!("Upload failed: {e:#}"),
                ));
                return None;
            }
        };
        info!("{}", outcome.message);

        let display_name = [&recipe.name, &recipe.film_stock]
            .into_iter()
            .find(|name| !name.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| "Custom Program".to_string());
        let record = UploadRecord {
            id: new_id(),
            recipe_id: Some(recipe.id.clone()),
            filename: outcome.device_filename.clone(),
            display_name,
            uploaded_at: timestamp(),
        };

        // the program is on the device either way
        if let Err(e) = self.engine.store().record_upload(&record).await {
            warn!("failed to record upload of {}: {e:#}", record.filename);
            self.notices.publish(Notice::failure(
                FailureKind::Persistence,
                "Failed to record upload",
            ));
        }

        self.notices
            .publish(Notice::success("Recipe uploaded to AGO"));
        Some(outcome)
    }

    pub async fn list_programs(&self) -> Option<Vec<RemoteProgram>> {
        let ip = self.connected_ip()?;

        match self.device.list_programs(&ip).await {
            Ok(programs) => Some(programs),
            Err(e) => {
                self.notices.publish(Notice::failure(
                    FailureKind::DeviceCommand,
                    format!("Failed to list programs: {e:#}"),
                ));
                None
            }
        }
    }

    /// Returns whether the program was deleted
    pub async fn delete_program(&self, filename: &str) -> bool {
        let Some(ip) = self.connected_ip() else {
            return false;
        };

        match self.device.delete_program(&ip, filename).await {
            Ok(()) => {
                self.notices
                    .publish(Notice::success("Program deleted from AGO"));
                true
            }
            Err(e) => {
                self.notices.publish(Notice::failure(
                    FailureKind::DeviceCommand,
                    format!("Delete failed: {e:#}"),
                ));
                false
            }
        }
    }
}
