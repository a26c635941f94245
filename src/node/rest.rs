//! REST side of a node: search loads and track decoding.

use std::time::Duration;

use reqwest::header::AUTHORIZATION;
use serde::Serialize;
use tracing::{debug, warn};

use super::protocol::{LoadTracksResponse, Requester, TrackInfo};
use super::NodeOptions;
use crate::error::Result;

#[derive(Serialize)]
struct LoadTracksBody<'a> {
    identifier: &'a str,
    user: &'a Requester,
}

#[derive(Debug, Clone)]
pub struct NodeRest {
    client: reqwest::Client,
    options: NodeOptions,
}

impl NodeRest {
    pub fn new(options: NodeOptions, timeout: Duration) -> Self {
        // El builder solo falla sin backend TLS; en ese caso usamos el cliente por defecto
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("No se pudo configurar el cliente HTTP: {}", e);
                reqwest::Client::new()
            });

        Self { client, options }
    }

    /// `POST /loadtracks`. Any HTTP or decoding failure is folded into a
    /// `LOAD_FAILED` response so callers see one failure shape.
    pub async fn load_tracks(&self, identifier: &str, requester: &Requester) -> LoadTracksResponse {
        debug!("🔍 Cargando '{}' vía REST en {}", identifier, self.options.url);

        let result = async {
            let response = self
                .client
                .post(self.options.rest_url("/loadtracks"))
                .header(AUTHORIZATION, &self.options.password)
                .json(&LoadTracksBody { identifier, user: requester })
                .send()
                .await?
                .error_for_status()?;
            response.json::<LoadTracksResponse>().await
        }
        .await;

        match result {
            Ok(response) => response,
            Err(e) => {
                warn!("❌ Carga REST fallida para '{}': {}", identifier, e);
                LoadTracksResponse::failed(identifier, e.to_string())
            }
        }
    }

    /// `GET /decodetrack?track=`
    pub async fn decode_track(&self, track: &str) -> Result<TrackInfo> {
        let path = format!("/decodetrack?track={}", urlencoding::encode(track));
        let info = self
            .client
            .get(self.options.rest_url(&path))
            .header(AUTHORIZATION, &self.options.password)
            .send()
            .await?
            .error_for_status()?
            .json::<TrackInfo>()
            .await?;
        Ok(info)
    }

    /// `POST /decodetracks`, one entry per input blob.
    pub async fn decode_tracks(&self, tracks: &[String]) -> Result<Vec<super::protocol::LoadedTrack>> {
        let decoded = self
            .client
            .post(self.options.rest_url("/decodetracks"))
            .header(AUTHORIZATION, &self.options.password)
            .json(tracks)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(decoded)
    }
}
