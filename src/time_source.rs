use chrono::{NaiveDate, NaiveDateTime};
use serde::Deserialize;
use ureq::Agent;

use crate::{config::TimeApiConfig, error::FetchError};

/// An authoritative wall-clock for one fixed time zone.
pub trait TimeSource: Send + Sync {
    fn fetch(&self) -> Result<NaiveDateTime, FetchError>;
}

/// Subset of the time API's JSON body. Other fields are ignored.
#[derive(Debug, Deserialize)]
struct ZoneTimeResponse {
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    seconds: u32,
}

/// # Errors
///
/// Returns [`FetchError::Malformed`] when the body is not JSON with the six
/// calendar fields and [`FetchError::InvalidDateTime`] when they do not form
/// a real date-time.
pub fn parse_zone_time(body: &str) -> Result<NaiveDateTime, FetchError> {
    let r: ZoneTimeResponse = serde_json::from_str(body)?;
    NaiveDate::from_ymd_opt(r.year, r.month, r.day)
        .and_then(|date| date.and_hms_opt(r.hour, r.minute, r.seconds))
        .ok_or(FetchError::InvalidDateTime {
            year: r.year,
            month: r.month,
            day: r.day,
            hour: r.hour,
            minute: r.minute,
            seconds: r.seconds,
        })
}

/// `GET {base_url}/api/time/current/zone?timeZone=<zone>` over HTTP(S).
pub struct TimeApiSource {
    agent: Agent,
    endpoint: String,
    time_zone: String,
}

impl TimeApiSource {
    #[must_use]
    pub fn new(config: &TimeApiConfig) -> Self {
        let agent_config = Agent::config_builder()
            .timeout_global(Some(config.request_timeout()))
            .http_status_as_error(false)
            .build();
        Self {
            agent: Agent::new_with_config(agent_config),
            endpoint: config.endpoint(),
            time_zone: config.time_zone.clone(),
        }
    }

    #[must_use]
    pub fn time_zone(&self) -> &str {
        &self.time_zone
    }
}

impl TimeSource for TimeApiSource {
    fn fetch(&self) -> Result<NaiveDateTime, FetchError> {
        let mut response = self
            .agent
            .get(&self.endpoint)
            .query("timeZone", &self.time_zone)
            .call()
            .map_err(FetchError::Transport)?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(FetchError::Status(status));
        }
        let body = response
            .body_mut()
            .read_to_string()
            .map_err(FetchError::Body)?;
        parse_zone_time(&body)
    }
}
