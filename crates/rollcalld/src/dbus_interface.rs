use crate::engine::EngineHandle;
use chrono::Local;
use rollcall_core::error::{ErrorKind, Failure, Outcome};
use rollcall_core::{AttendanceRecord, AttendanceService, FaceOutcome, Profile, Registered};
use serde::Serialize;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
///
/// Every method answers with a JSON `Outcome`: `{"success": ...}` or
/// `{"failure": {"kind": ..., "message": ...}}`.
pub struct AttendanceBus {
    service: Arc<AttendanceService>,
    engine: EngineHandle,
}

impl AttendanceBus {
    pub fn new(service: Arc<AttendanceService>, engine: EngineHandle) -> Self {
        Self { service, engine }
    }

    async fn check_in_image(&self, image: Vec<u8>) -> Result<Vec<FaceOutcome>, Failure> {
        let faces = self.engine.detect_faces(image).await?;
        let now = Local::now().naive_local();
        let service = self.service.clone();
        blocking(move || Ok(service.recognize(faces, now))).await
    }

    async fn register_images(
        &self,
        profile: Profile,
        images: Vec<Vec<u8>>,
        replace: bool,
    ) -> Result<Registered, Failure> {
        let images = Arc::new(images);
        let batch = self.engine.extract_samples(images.clone()).await?;
        let now = Local::now().naive_local();
        let service = self.service.clone();
        blocking(move || {
            let result = if replace {
                service.reregister(profile, batch, &images, now)
            } else {
                service.register(profile, batch, &images, now)
            };
            result.map_err(Failure::from)
        })
        .await
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceBus {
    /// Match every face in an image and mark attendance for known ones.
    async fn check_in(&self, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(bytes = image.len(), "check_in requested");
        reply(Outcome::from(self.check_in_image(image).await))
    }

    /// Register a new identity from sample images.
    async fn register(
        &self,
        reg_no: &str,
        name: &str,
        cohort: &str,
        phone: &str,
        images: Vec<Vec<u8>>,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(reg_no, samples = images.len(), "register requested");
        let profile = profile(reg_no, name, cohort, phone);
        reply(Outcome::from(self.register_images(profile, images, false).await))
    }

    /// Replace the fingerprint and attributes of an existing identity.
    async fn reregister(
        &self,
        reg_no: &str,
        name: &str,
        cohort: &str,
        phone: &str,
        images: Vec<Vec<u8>>,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(reg_no, samples = images.len(), "reregister requested");
        let profile = profile(reg_no, name, cohort, phone);
        reply(Outcome::from(self.register_images(profile, images, true).await))
    }

    /// Most recent attendance records, newest first.
    async fn recent(&self, limit: u32) -> zbus::fdo::Result<String> {
        let service = self.service.clone();
        let result: Result<Vec<AttendanceRecord>, Failure> =
            blocking(move || service.recent(limit as usize).map_err(Failure::from)).await;
        reply(Outcome::from(result))
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.service.status();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "identities": status.identities,
            "metric": status.metric,
            "threshold": status.threshold,
            "min_samples": status.min_samples,
            "workers": self.engine.workers(),
        })
        .to_string())
    }
}

fn profile(reg_no: &str, name: &str, cohort: &str, phone: &str) -> Profile {
    Profile {
        reg_no: reg_no.to_string(),
        name: name.to_string(),
        cohort: cohort.to_string(),
        phone: phone.to_string(),
    }
}

/// Run database work off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, Failure>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, Failure> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Failure::new(ErrorKind::Unavailable, format!("blocking task failed: {e}")))?
}

fn reply<T: Serialize>(outcome: Outcome<T>) -> zbus::fdo::Result<String> {
    if let Outcome::Failure(failure) = &outcome {
        tracing::warn!(kind = %failure.kind, message = %failure.message, "request failed");
    }
    serde_json::to_string(&outcome).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}
