// Data models and loading for the Train & Culture Voyage planner
// Events: concert listings across ten major French cities
//
// Local data files (shipped in data/):
// - concerts.csv                          comma-delimited, UTF-8
// - lieu_concert.geocoded.csv             comma-delimited, UTF-8
// - Empreinte_carbone_trajet_train.csv    semicolon-delimited, Latin-1
//
// Train search: an external Trainline-compatible search service, answering a
// semicolon-delimited itinerary table over HTTP. Configure the endpoint with
// TCV_TRAINLINE_URL.

use chrono::{Local, NaiveDate, TimeZone, Utc};
use chrono_tz::Europe::Paris;
use reqwest::blocking;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

// ============================================================================
// Data Structures
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub title: String,
    pub description: String,
    pub venue: String,
    pub city: String,
    pub latitude: f64,
    pub longitude: f64,
    pub start_date: String,
    pub end_date: String,
    pub price: String,
    pub discount: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    pub city: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarbonFootprint {
    pub route: String,
    pub co2_kg: f64,
}

/// An event enriched with the derived columns the sorted table exposes.
#[derive(Debug, Clone, Serialize)]
pub struct RankedEvent {
    pub title: String,
    pub description: String,
    pub venue: String,
    pub city: String,
    pub latitude: f64,
    pub longitude: f64,
    pub start_date: String,
    pub end_date: String,
    pub price: String,
    pub discount: Option<String>,
    pub price_value: Option<f64>,
    pub has_discount: bool,
}

impl RankedEvent {
    fn from_event(event: Event) -> Self {
        let has_discount = event
            .discount
            .as_ref()
            .map(|d| !d.trim().is_empty())
            .unwrap_or(false);

        RankedEvent {
            title: event.title,
            description: event.description,
            venue: event.venue,
            city: event.city,
            latitude: event.latitude,
            longitude: event.longitude,
            start_date: event.start_date,
            end_date: event.end_date,
            price: event.price,
            discount: event.discount,
            price_value: None,
            has_discount,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    CheapestFirst,
    MostExpensiveFirst,
    SoonestEndDateFirst,
    SoonestStartDateFirst,
    DiscountedFirst,
}

impl SortKey {
    pub fn parse(key: &str) -> Option<SortKey> {
        match key {
            "cheapest-first" => Some(SortKey::CheapestFirst),
            "most-expensive-first" => Some(SortKey::MostExpensiveFirst),
            "soonest-end-date-first" => Some(SortKey::SoonestEndDateFirst),
            "soonest-start-date-first" => Some(SortKey::SoonestStartDateFirst),
            "discounted-first" => Some(SortKey::DiscountedFirst),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MapMarker {
    pub latitude: f64,
    pub longitude: f64,
    pub label: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MapView {
    pub center_latitude: f64,
    pub center_longitude: f64,
    pub zoom: u8,
    pub clustered: bool,
    pub markers: Vec<MapMarker>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetStats {
    pub total_events: usize,
    pub total_cities: usize,
    pub carbon_routes: usize,
    pub last_loaded: u64,
}

// ============================================================================
// Train Search Structures
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainQuery {
    pub departure_station: String,
    pub arrival_station: String,
    pub from_date: String,
    pub to_date: String,
}

/// One itinerary row after normalization of the raw search table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainResult {
    pub departure_date: String,
    pub arrival_date: String,
    pub duration: String,
    pub duration_minutes: u32,
    pub price: f64,
}

/// The same row re-labeled for display in the results table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainDisplayRow {
    #[serde(rename = "Date de départ")]
    pub departure_date: String,
    #[serde(rename = "Date d'arrivée")]
    pub arrival_date: String,
    #[serde(rename = "Durée")]
    pub duration: String,
    #[serde(rename = "Prix")]
    pub price: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripReport {
    pub departure_city: String,
    pub arrival_city: String,
    pub results: Vec<TrainDisplayRow>,
    pub co2_kg: Option<f64>,
    pub warning: Option<String>,
    pub message: Option<String>,
}

impl TripReport {
    pub fn no_results(departure_city: &str, arrival_city: &str, warning: Option<String>) -> Self {
        TripReport {
            departure_city: departure_city.to_string(),
            arrival_city: arrival_city.to_string(),
            results: Vec::new(),
            co2_kg: None,
            warning,
            message: Some(TCVModels::NO_RESULTS_MESSAGE.to_string()),
        }
    }
}

/// Departure/return window for a ticket search. Missing dates fall back to
/// the selected event's start date; missing times to 08:00 / 16:00.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchWindow {
    pub from_date: Option<String>,
    pub from_time: Option<String>,
    pub to_date: Option<String>,
    pub to_time: Option<String>,
}

/// External search collaborator. Answers a semicolon-delimited itinerary
/// table; the planner never looks past that contract.
pub trait TrainSearch: Send + Sync {
    fn search(&self, query: &TrainQuery) -> Result<String>;
}

pub struct TrainlineClient {
    base_url: String,
}

impl TrainlineClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        TrainlineClient {
            base_url: base_url.into(),
        }
    }

    pub fn from_env() -> Self {
        let base_url = std::env::var("TCV_TRAINLINE_URL")
            .unwrap_or_else(|_| TCVModels::TRAINLINE_BASE_URL.to_string());
        TrainlineClient::new(base_url)
    }
}

impl TrainSearch for TrainlineClient {
    fn search(&self, query: &TrainQuery) -> Result<String> {
        let client = blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(TCVModels::REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| TCVError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        let response = client
            .get(format!("{}/search", self.base_url))
            .query(&[
                ("departure_station", query.departure_station.as_str()),
                ("arrival_station", query.arrival_station.as_str()),
                ("from_date", query.from_date.as_str()),
                ("to_date", query.to_date.as_str()),
            ])
            .send()
            .map_err(|e| TCVError::NetworkError(format!("Failed to search train tickets: {}", e)))?;

        if !response.status().is_success() {
            return Err(TCVError::NetworkError(format!(
                "Train search returned error: {}",
                response.status()
            )));
        }

        response
            .text()
            .map_err(|e| TCVError::NetworkError(format!("Failed to read search response: {}", e)))
    }
}

// ============================================================================
// Session State
// ============================================================================

// Selections and the last search result live here, never in a global.
// One logical user session; reset on restart.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub selected_city: Option<String>,
    pub selected_event: Option<String>,
    pub selected_departure_city: Option<String>,
    pub last_report: Option<TripReport>,
}

// ============================================================================
// Cache Structure
// ============================================================================

#[derive(Debug, Clone)]
pub struct CachedCultureData {
    pub events: Vec<Event>,
    pub locations: Vec<Location>,
    pub carbon: Vec<CarbonFootprint>,
    pub last_loaded: u64,
}

impl CachedCultureData {
    pub fn stats(&self) -> DatasetStats {
        let total_cities = self
            .events
            .iter()
            .map(|e| e.city.as_str())
            .collect::<HashSet<_>>()
            .len();

        DatasetStats {
            total_events: self.events.len(),
            total_cities,
            carbon_routes: self.carbon.len(),
            last_loaded: self.last_loaded,
        }
    }

    pub fn city_events(&self, city: &str) -> Vec<Event> {
        self.events
            .iter()
            .filter(|e| e.city.eq_ignore_ascii_case(city))
            .cloned()
            .collect()
    }

    pub fn location_of(&self, city: &str) -> Option<&Location> {
        self.locations
            .iter()
            .find(|l| l.city.eq_ignore_ascii_case(city))
    }

    pub fn event_by_title(&self, city: &str, title: &str) -> Option<&Event> {
        self.events
            .iter()
            .find(|e| e.city.eq_ignore_ascii_case(city) && e.title == title)
    }

    /// Departure choices for an event in `city`: the allow-list minus that city.
    pub fn departure_cities(&self, city: &str) -> Vec<String> {
        TCVModels::CITIES
            .iter()
            .filter(|c| !c.eq_ignore_ascii_case(city))
            .map(|c| c.to_string())
            .collect()
    }
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug)]
pub enum TCVError {
    NetworkError(String),
    ParseError(String),
    FileError(String),
}

impl std::fmt::Display for TCVError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TCVError::NetworkError(e) => write!(f, "Network error: {}", e),
            TCVError::ParseError(e) => write!(f, "Parse error: {}", e),
            TCVError::FileError(e) => write!(f, "File error: {}", e),
        }
    }
}

impl std::error::Error for TCVError {}

pub type Result<T> = std::result::Result<T, TCVError>;

// ============================================================================
// Main Implementation
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub enum TextEncoding {
    Utf8,
    Latin1,
}

pub struct TCVModels;

impl TCVModels {
    pub const CITIES: [&'static str; 10] = [
        "Avignon",
        "Nice",
        "Marseille",
        "Paris",
        "Lyon",
        "Montpellier",
        "Toulouse",
        "Bordeaux",
        "Nantes",
        "Lille",
    ];

    pub const EVENTS_FILE: &'static str = "concerts.csv";
    pub const LOCATIONS_FILE: &'static str = "lieu_concert.geocoded.csv";
    pub const CARBON_FILE: &'static str = "Empreinte_carbone_trajet_train.csv";

    const FRANCE_CENTER: (f64, f64) = (46.2276, 2.2137);
    const FRANCE_ZOOM: u8 = 6;
    const CITY_ZOOM: u8 = 12;

    const DATE_FORMAT: &'static str = "%Y-%m-%d";
    const WINDOW_DATE_FORMAT: &'static str = "%d/%m/%Y";
    const DEFAULT_FROM_TIME: &'static str = "08:00";
    const DEFAULT_TO_TIME: &'static str = "16:00";

    const TRAINLINE_BASE_URL: &'static str = "http://127.0.0.1:9090/api/trainline";
    pub const REQUEST_TIMEOUT_SECS: u64 = 30;

    pub const NO_RESULTS_MESSAGE: &'static str =
        "Aucun résultat à afficher. Veuillez lancer une recherche.";

    // ========================================================================
    // CSV Loading
    // ========================================================================

    /// Best-effort read of a delimited file. Errors come back to the caller,
    /// who degrades to an absent table instead of crashing the page.
    fn read_table(
        path: &Path,
        delimiter: u8,
        encoding: TextEncoding,
    ) -> Result<(csv::StringRecord, Vec<csv::StringRecord>)> {
        let bytes = fs::read(path)
            .map_err(|e| TCVError::FileError(format!("Failed to read {:?}: {}", path, e)))?;

        let contents = match encoding {
            TextEncoding::Utf8 => String::from_utf8(bytes)
                .map_err(|e| TCVError::ParseError(format!("Invalid UTF-8 in {:?}: {}", path, e)))?,
            // Latin-1 maps each byte to the code point of the same value
            TextEncoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        };

        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .from_reader(contents.as_bytes());

        let headers = rdr
            .headers()
            .map_err(|e| TCVError::ParseError(format!("Failed to read header of {:?}: {}", path, e)))?
            .clone();

        let mut records = Vec::new();
        for result in rdr.records() {
            let record = result
                .map_err(|e| TCVError::ParseError(format!("Malformed record in {:?}: {}", path, e)))?;
            records.push(record);
        }

        Ok((headers, records))
    }

    /// Case-insensitive header name -> 0-based index.
    fn column_indices(headers: &csv::StringRecord) -> HashMap<String, usize> {
        headers
            .iter()
            .enumerate()
            .map(|(i, name)| (name.trim().to_lowercase(), i))
            .collect()
    }

    fn required_column(columns: &HashMap<String, usize>, name: &str, path: &Path) -> Result<usize> {
        columns.get(name).copied().ok_or_else(|| {
            TCVError::ParseError(format!("Column '{}' not found in {:?}", name, path))
        })
    }

    pub fn load_events(path: &Path) -> Result<Vec<Event>> {
        let (headers, records) = Self::read_table(path, b',', TextEncoding::Utf8)?;
        let columns = Self::column_indices(&headers);

        let title_idx = Self::required_column(&columns, "titre", path)?;
        let city_idx = Self::required_column(&columns, "result_city", path)?;
        let lat_idx = Self::required_column(&columns, "latitude", path)?;
        let lon_idx = Self::required_column(&columns, "longitude", path)?;
        let start_idx = Self::required_column(&columns, "start_date", path)?;
        let end_idx = Self::required_column(&columns, "end_date", path)?;
        let price_idx = Self::required_column(&columns, "prix", path)?;
        let description_idx = columns.get("description").copied();
        let venue_idx = columns.get("lieu").copied();
        let discount_idx = columns.get("reduction").copied();

        let events = records
            .iter()
            .filter_map(|record| {
                let title = record.get(title_idx)?.to_string();
                let city = record.get(city_idx)?.to_string();
                // Coordinates are carried through unvalidated; a value that
                // does not parse lands on 0.0 and mis-places the marker.
                let latitude = record
                    .get(lat_idx)
                    .and_then(|s| s.trim().parse::<f64>().ok())
                    .unwrap_or(0.0);
                let longitude = record
                    .get(lon_idx)
                    .and_then(|s| s.trim().parse::<f64>().ok())
                    .unwrap_or(0.0);

                Some(Event {
                    title,
                    description: description_idx
                        .and_then(|i| record.get(i))
                        .unwrap_or_default()
                        .to_string(),
                    venue: venue_idx
                        .and_then(|i| record.get(i))
                        .unwrap_or_default()
                        .to_string(),
                    city,
                    latitude,
                    longitude,
                    start_date: record.get(start_idx)?.to_string(),
                    end_date: record.get(end_idx)?.to_string(),
                    price: record.get(price_idx)?.to_string(),
                    discount: discount_idx
                        .and_then(|i| record.get(i))
                        .map(|s| s.to_string())
                        .filter(|s| !s.is_empty()),
                })
            })
            .collect();

        Ok(events)
    }

    pub fn load_locations(path: &Path) -> Result<Vec<Location>> {
        let (headers, records) = Self::read_table(path, b',', TextEncoding::Utf8)?;
        let columns = Self::column_indices(&headers);

        let city_idx = Self::required_column(&columns, "result_city", path)?;
        let lat_idx = Self::required_column(&columns, "latitude", path)?;
        let lon_idx = Self::required_column(&columns, "longitude", path)?;

        let locations = records
            .iter()
            .filter_map(|record| {
                let city = record.get(city_idx)?.to_string();
                let latitude = record.get(lat_idx)?.trim().parse::<f64>().ok()?;
                let longitude = record.get(lon_idx)?.trim().parse::<f64>().ok()?;
                Some(Location {
                    city,
                    latitude,
                    longitude,
                })
            })
            .collect();

        Ok(locations)
    }

    pub fn load_carbon(path: &Path) -> Result<Vec<CarbonFootprint>> {
        let (headers, records) = Self::read_table(path, b';', TextEncoding::Latin1)?;
        let columns = Self::column_indices(&headers);

        let route_idx = Self::required_column(&columns, "trajet", path)?;
        let co2_idx = Self::required_column(&columns, "co2 emis en kg", path)?;

        let rows = records
            .iter()
            .filter_map(|record| {
                let route = record.get(route_idx)?.trim().to_string();
                let co2_kg = record
                    .get(co2_idx)?
                    .trim()
                    .replace(',', ".")
                    .parse::<f64>()
                    .ok()?;
                Some(CarbonFootprint { route, co2_kg })
            })
            .collect();

        Ok(rows)
    }

    // ========================================================================
    // Event Filtering / Cleaning
    // ========================================================================

    /// Keep events whose end date is today or later. A malformed end date
    /// fails the whole pass; there is no row-level quarantine.
    pub fn clean_events(events: Vec<Event>, today: NaiveDate) -> Result<Vec<Event>> {
        let mut kept = Vec::new();

        for event in events {
            let end = NaiveDate::parse_from_str(&event.end_date, Self::DATE_FORMAT).map_err(|e| {
                TCVError::ParseError(format!(
                    "Invalid end_date '{}' for event '{}': {}",
                    event.end_date, event.title, e
                ))
            })?;

            if end >= today {
                kept.push(event);
            }
        }

        Ok(kept)
    }

    pub fn clean_locations(locations: Vec<Location>) -> Vec<Location> {
        locations
            .into_iter()
            .filter(|l| Self::CITIES.iter().any(|c| c.eq_ignore_ascii_case(&l.city)))
            .collect()
    }

    // ========================================================================
    // Price / Duration Conversion
    // ========================================================================

    /// "12,50 €" -> 12.5. Strips the currency glyph and converts the decimal
    /// comma; already-normalized input converts to the same value.
    pub fn convert_price(price: &str) -> Result<f64> {
        let cleaned = price.replace('€', "").replace(',', ".");
        cleaned
            .trim()
            .parse::<f64>()
            .map_err(|e| TCVError::ParseError(format!("Invalid price '{}': {}", price, e)))
    }

    /// 12.5 -> "12,50 €"
    pub fn format_price(value: f64) -> String {
        format!("{:.2} €", value).replace('.', ",")
    }

    /// "5h17m" -> 317
    pub fn parse_duration_minutes(duration: &str) -> Result<u32> {
        let (hours, rest) = duration
            .split_once('h')
            .ok_or_else(|| TCVError::ParseError(format!("Invalid duration '{}'", duration)))?;

        let hours: u32 = hours
            .trim()
            .parse()
            .map_err(|e| TCVError::ParseError(format!("Invalid duration '{}': {}", duration, e)))?;
        let minutes: u32 = rest
            .trim()
            .trim_end_matches('m')
            .trim()
            .parse()
            .map_err(|e| TCVError::ParseError(format!("Invalid duration '{}': {}", duration, e)))?;

        Ok(hours * 60 + minutes)
    }

    pub fn format_duration(total_minutes: u32) -> String {
        format!("{}h{:02}m", total_minutes / 60, total_minutes % 60)
    }

    // ========================================================================
    // Sort Engine
    // ========================================================================

    /// Reorder one city's events. `None` (an unrecognized key) returns the
    /// input unchanged. Price keys derive a numeric price column first; the
    /// discount key is a stable partition with no secondary ordering.
    pub fn sort_events(events: Vec<Event>, key: Option<SortKey>) -> Result<Vec<RankedEvent>> {
        let mut ranked: Vec<RankedEvent> = events.into_iter().map(RankedEvent::from_event).collect();

        let Some(key) = key else {
            return Ok(ranked);
        };

        match key {
            SortKey::CheapestFirst | SortKey::MostExpensiveFirst => {
                for event in &mut ranked {
                    event.price_value = Some(Self::convert_price(&event.price)?);
                }
                ranked.sort_by(|a, b| {
                    let pa = a.price_value.unwrap_or(f64::MAX);
                    let pb = b.price_value.unwrap_or(f64::MAX);
                    pa.total_cmp(&pb)
                });
                if key == SortKey::MostExpensiveFirst {
                    ranked.reverse();
                }
            }
            SortKey::SoonestEndDateFirst => {
                let mut keyed = Vec::with_capacity(ranked.len());
                for event in ranked {
                    let end = NaiveDate::parse_from_str(&event.end_date, Self::DATE_FORMAT)
                        .map_err(|e| {
                            TCVError::ParseError(format!(
                                "Invalid end_date '{}' for event '{}': {}",
                                event.end_date, event.title, e
                            ))
                        })?;
                    keyed.push((end, event));
                }
                keyed.sort_by_key(|(end, _)| *end);
                return Ok(keyed.into_iter().map(|(_, event)| event).collect());
            }
            SortKey::SoonestStartDateFirst => {
                // Start dates are ISO-formatted; lexicographic order is
                // chronological and tolerates the malformed values the trip
                // builder papers over later.
                ranked.sort_by(|a, b| a.start_date.cmp(&b.start_date));
            }
            SortKey::DiscountedFirst => {
                ranked.sort_by_key(|event| !event.has_discount);
            }
        }

        Ok(ranked)
    }

    // ========================================================================
    // Map Building
    // ========================================================================

    /// Map view model for the frontend renderer: one clustered marker per
    /// event, centered on the supplied location or on the arithmetic mean of
    /// the event coordinates (France when the table is empty).
    pub fn build_map(events: &[Event], center: Option<&Location>) -> MapView {
        let (center_latitude, center_longitude, zoom) = match center {
            Some(location) => (location.latitude, location.longitude, Self::CITY_ZOOM),
            None if events.is_empty() => {
                (Self::FRANCE_CENTER.0, Self::FRANCE_CENTER.1, Self::FRANCE_ZOOM)
            }
            None => {
                let count = events.len() as f64;
                let latitude = events.iter().map(|e| e.latitude).sum::<f64>() / count;
                let longitude = events.iter().map(|e| e.longitude).sum::<f64>() / count;
                (latitude, longitude, Self::FRANCE_ZOOM)
            }
        };

        let markers = events
            .iter()
            .map(|event| MapMarker {
                latitude: event.latitude,
                longitude: event.longitude,
                label: event.title.clone(),
            })
            .collect();

        MapView {
            center_latitude,
            center_longitude,
            zoom,
            clustered: true,
            markers,
        }
    }

    // ========================================================================
    // Carbon Footprint Lookup
    // ========================================================================

    /// First row whose route label contains "A - B" or "B - A",
    /// case-insensitive.
    pub fn find_carbon_footprint<'a>(
        table: &'a [CarbonFootprint],
        departure: &str,
        arrival: &str,
    ) -> Option<&'a CarbonFootprint> {
        let outbound = format!("{} - {}", departure, arrival).to_lowercase();
        let inbound = format!("{} - {}", arrival, departure).to_lowercase();

        table.iter().find(|row| {
            let route = row.route.to_lowercase();
            route.contains(&outbound) || route.contains(&inbound)
        })
    }

    // ========================================================================
    // Trip Report Builder
    // ========================================================================

    /// Normalize the raw semicolon-delimited search table: keep the four
    /// display columns (currency, transport mode and booking flags are
    /// dropped when present), convert the price to a number and the duration
    /// to total minutes.
    pub fn clean_train_results(csv_text: &str) -> Result<Vec<TrainResult>> {
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(b';')
            .has_headers(true)
            .from_reader(csv_text.as_bytes());

        let headers = rdr
            .headers()
            .map_err(|e| TCVError::ParseError(format!("Failed to read search table header: {}", e)))?
            .clone();
        let columns = Self::column_indices(&headers);

        let missing = |name: &str| TCVError::ParseError(format!("Column '{}' missing from search table", name));
        let departure_idx = *columns.get("departure_date").ok_or_else(|| missing("departure_date"))?;
        let arrival_idx = *columns.get("arrival_date").ok_or_else(|| missing("arrival_date"))?;
        let duration_idx = *columns.get("duration").ok_or_else(|| missing("duration"))?;
        let price_idx = *columns.get("price").ok_or_else(|| missing("price"))?;

        let mut results = Vec::new();
        for record in rdr.records() {
            let record = record
                .map_err(|e| TCVError::ParseError(format!("Malformed search table row: {}", e)))?;

            let field = |idx: usize| record.get(idx).unwrap_or("").to_string();
            let duration = field(duration_idx);
            let duration_minutes = Self::parse_duration_minutes(&duration)?;
            let price = Self::convert_price(&field(price_idx))?;

            results.push(TrainResult {
                departure_date: field(departure_idx),
                arrival_date: field(arrival_idx),
                duration,
                duration_minutes,
                price,
            });
        }

        Ok(results)
    }

    pub fn to_display_rows(results: &[TrainResult]) -> Vec<TrainDisplayRow> {
        results
            .iter()
            .map(|r| TrainDisplayRow {
                departure_date: r.departure_date.clone(),
                arrival_date: r.arrival_date.clone(),
                duration: r.duration.clone(),
                price: Self::format_price(r.price),
            })
            .collect()
    }

    /// Resolve the search window. Dates missing from the request fall back to
    /// the event's start date; an unparseable start date falls back to today
    /// and surfaces a visible warning.
    fn resolve_window(
        event: &Event,
        window: &SearchWindow,
        today: NaiveDate,
    ) -> (String, String, Option<String>) {
        let mut warning = None;

        let default_date = match NaiveDate::parse_from_str(&event.start_date, Self::DATE_FORMAT) {
            Ok(date) => date,
            Err(_) => {
                warning = Some(format!(
                    "Format de date invalide pour « {} » ({}), date du jour utilisée.",
                    event.title, event.start_date
                ));
                today
            }
        };
        let default_date = default_date.format(Self::WINDOW_DATE_FORMAT).to_string();

        let from = format!(
            "{} {}",
            window.from_date.clone().unwrap_or_else(|| default_date.clone()),
            window.from_time.clone().unwrap_or_else(|| Self::DEFAULT_FROM_TIME.to_string()),
        );
        let to = format!(
            "{} {}",
            window.to_date.clone().unwrap_or(default_date),
            window.to_time.clone().unwrap_or_else(|| Self::DEFAULT_TO_TIME.to_string()),
        );

        (from, to, warning)
    }

    /// One external search, normalized and joined with the carbon-footprint
    /// table. Failures degrade to the explicit no-results state; the report
    /// itself never errors.
    pub fn build_trip_report(
        event: &Event,
        departure_city: &str,
        window: &SearchWindow,
        searcher: &dyn TrainSearch,
        carbon: &[CarbonFootprint],
        today: NaiveDate,
    ) -> TripReport {
        let (from_date, to_date, warning) = Self::resolve_window(event, window, today);

        let query = TrainQuery {
            departure_station: departure_city.to_string(),
            arrival_station: event.city.clone(),
            from_date,
            to_date,
        };

        let csv_text = match searcher.search(&query) {
            Ok(text) => text,
            Err(e) => {
                eprintln!(
                    "⚠️  Train search {} -> {} failed: {}",
                    departure_city, event.city, e
                );
                return TripReport::no_results(departure_city, &event.city, warning);
            }
        };

        let results = match Self::clean_train_results(&csv_text) {
            Ok(results) => results,
            Err(e) => {
                eprintln!("⚠️  Could not read search results: {}", e);
                return TripReport::no_results(departure_city, &event.city, warning);
            }
        };

        if results.is_empty() {
            return TripReport::no_results(departure_city, &event.city, warning);
        }

        let co2_kg = Self::find_carbon_footprint(carbon, departure_city, &event.city)
            .map(|row| row.co2_kg);

        TripReport {
            departure_city: departure_city.to_string(),
            arrival_city: event.city.clone(),
            results: Self::to_display_rows(&results),
            co2_kg,
            warning,
            message: None,
        }
    }

    // ========================================================================
    // Cache Initialization
    // ========================================================================

    /// Load the three data files. Every failure degrades to an absent table
    /// with a logged warning; the dashboard then shows "nothing" instead of
    /// refusing to start.
    pub fn initialize_cache(data_dir: &Path) -> CachedCultureData {
        println!("📚 Loading cultural event data from {:?}...", data_dir);

        let today = Local::now().date_naive();

        let raw_events = Self::load_events(&data_dir.join(Self::EVENTS_FILE)).unwrap_or_else(|e| {
            eprintln!("⚠️  Warning: Could not load events ({})", e);
            Vec::new()
        });
        let loaded = raw_events.len();

        let events = Self::clean_events(raw_events, today).unwrap_or_else(|e| {
            eprintln!("⚠️  Warning: Could not clean events ({})", e);
            Vec::new()
        });
        println!("   ✓ {} upcoming events ({} loaded)", events.len(), loaded);

        let locations = Self::load_locations(&data_dir.join(Self::LOCATIONS_FILE))
            .unwrap_or_else(|e| {
                eprintln!("⚠️  Warning: Could not load locations ({})", e);
                Vec::new()
            });
        let locations = Self::clean_locations(locations);
        println!("   ✓ {} destination cities", locations.len());

        let carbon = Self::load_carbon(&data_dir.join(Self::CARBON_FILE)).unwrap_or_else(|e| {
            eprintln!("⚠️  Warning: Could not load carbon footprints ({})", e);
            Vec::new()
        });
        println!("   ✓ {} carbon footprint routes", carbon.len());

        CachedCultureData {
            events,
            locations,
            carbon,
            last_loaded: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }

    pub fn reload_cache(cache: &mut CachedCultureData, data_dir: &Path) {
        println!("🔄 Reloading cultural event data...");
        *cache = Self::initialize_cache(data_dir);
    }

    // ========================================================================
    // Timestamps
    // ========================================================================

    pub fn format_timestamp_full(timestamp: i64) -> String {
        match Utc.timestamp_opt(timestamp, 0).single() {
            Some(dt) => {
                let paris_time = dt.with_timezone(&Paris);
                paris_time.format("%Y-%m-%d %H:%M:%S").to_string()
            }
            None => format!("Invalid timestamp: {}", timestamp),
        }
    }

    pub fn get_current_timestamp() -> i64 {
        Utc::now().timestamp()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn event(title: &str, city: &str, price: &str, discount: Option<&str>) -> Event {
        Event {
            title: title.to_string(),
            description: String::new(),
            venue: "Salle des fêtes".to_string(),
            city: city.to_string(),
            latitude: 48.8566,
            longitude: 2.3522,
            start_date: "2031-05-10".to_string(),
            end_date: "2031-05-12".to_string(),
            price: price.to_string(),
            discount: discount.map(|d| d.to_string()),
        }
    }

    struct FixedSearch {
        csv: &'static str,
    }

    impl TrainSearch for FixedSearch {
        fn search(&self, _query: &TrainQuery) -> Result<String> {
            Ok(self.csv.to_string())
        }
    }

    struct FailingSearch;

    impl TrainSearch for FailingSearch {
        fn search(&self, _query: &TrainQuery) -> Result<String> {
            Err(TCVError::NetworkError("connection refused".to_string()))
        }
    }

    const SEARCH_CSV: &str = "\
departure_date;arrival_date;duration;price;currency;transportation_mean;bicycle_reservation
2031-05-10 08:16;2031-05-10 10:13;1h57m;44,50;EUR;train;unavailable
2031-05-10 10:04;2031-05-10 12:29;2h25m;29,00;EUR;train;unavailable
";

    #[test]
    fn convert_price_strips_glyph_and_comma() {
        assert_eq!(TCVModels::convert_price("12,50 €").unwrap(), 12.5);
        assert_eq!(TCVModels::convert_price("5,00").unwrap(), 5.0);
    }

    #[test]
    fn convert_price_is_idempotent_on_normalized_input() {
        assert_eq!(TCVModels::convert_price("12.50").unwrap(), 12.5);
    }

    #[test]
    fn convert_price_fails_loudly_on_garbage() {
        assert!(TCVModels::convert_price("gratuit").is_err());
    }

    #[test]
    fn price_round_trips_through_display_format() {
        let value = TCVModels::convert_price("12,50 €").unwrap();
        assert_eq!(TCVModels::format_price(value), "12,50 €");
    }

    #[test]
    fn duration_converts_to_total_minutes() {
        assert_eq!(TCVModels::parse_duration_minutes("5h17m").unwrap(), 317);
        assert_eq!(TCVModels::parse_duration_minutes("0h48m").unwrap(), 48);
        assert_eq!(TCVModels::parse_duration_minutes("2h 05m").unwrap(), 125);
    }

    #[test]
    fn duration_round_trips_through_display_format() {
        let minutes = TCVModels::parse_duration_minutes("5h17m").unwrap();
        assert_eq!(TCVModels::format_duration(minutes), "5h17m");
        assert_eq!(TCVModels::format_duration(48), "0h48m");
    }

    #[test]
    fn clean_events_keeps_only_future_events() {
        let today = NaiveDate::from_ymd_opt(2031, 5, 1).unwrap();
        let mut past = event("Concert passé", "Lyon", "10,00 €", None);
        past.end_date = "2031-04-30".to_string();
        let future = event("Concert à venir", "Lyon", "10,00 €", None);

        let cleaned = TCVModels::clean_events(vec![past, future], today).unwrap();
        assert_eq!(cleaned.len(), 1);
        assert_eq!(cleaned[0].title, "Concert à venir");
    }

    #[test]
    fn clean_events_is_idempotent() {
        let today = NaiveDate::from_ymd_opt(2031, 5, 1).unwrap();
        let events = vec![
            event("Premier", "Lyon", "10,00 €", None),
            event("Second", "Paris", "15,00 €", None),
        ];

        let once = TCVModels::clean_events(events, today).unwrap();
        let twice = TCVModels::clean_events(once.clone(), today).unwrap();
        assert_eq!(once.len(), twice.len());
    }

    #[test]
    fn clean_events_fails_fast_on_malformed_date() {
        let today = NaiveDate::from_ymd_opt(2031, 5, 1).unwrap();
        let mut bad = event("Date cassée", "Lyon", "10,00 €", None);
        bad.end_date = "bientôt".to_string();

        assert!(TCVModels::clean_events(vec![bad], today).is_err());
    }

    #[test]
    fn clean_locations_applies_city_allow_list() {
        let locations = vec![
            Location {
                city: "Paris".to_string(),
                latitude: 48.8566,
                longitude: 2.3522,
            },
            Location {
                city: "Bruxelles".to_string(),
                latitude: 50.8503,
                longitude: 4.3517,
            },
        ];

        let kept = TCVModels::clean_locations(locations);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].city, "Paris");
    }

    #[test]
    fn cheapest_first_orders_by_numeric_price() {
        let events = vec![
            event("Cher", "Lyon", "12,50 €", None),
            event("Abordable", "Lyon", "5,00 €", None),
        ];

        let sorted = TCVModels::sort_events(events, Some(SortKey::CheapestFirst)).unwrap();
        assert_eq!(sorted[0].title, "Abordable");
        assert_eq!(sorted[0].price_value, Some(5.0));
        assert_eq!(sorted[1].title, "Cher");
    }

    #[test]
    fn most_expensive_first_reverses_price_order() {
        let events = vec![
            event("Abordable", "Lyon", "5,00 €", None),
            event("Cher", "Lyon", "12,50 €", None),
        ];

        let sorted = TCVModels::sort_events(events, Some(SortKey::MostExpensiveFirst)).unwrap();
        assert_eq!(sorted[0].title, "Cher");
    }

    #[test]
    fn discounted_first_partitions_regardless_of_input_order() {
        for (first, second) in [("Plein tarif", "Promo"), ("Promo", "Plein tarif")] {
            let events = vec![
                event(first, "Lyon", "10,00 €", (first == "Promo").then_some("-20%")),
                event(second, "Lyon", "10,00 €", (second == "Promo").then_some("-20%")),
            ];

            let sorted = TCVModels::sort_events(events, Some(SortKey::DiscountedFirst)).unwrap();
            assert_eq!(sorted[0].title, "Promo");
            assert!(sorted[0].has_discount);
            assert!(!sorted[1].has_discount);
        }
    }

    #[test]
    fn discounted_first_is_a_stable_partition() {
        let events = vec![
            event("Promo A", "Lyon", "10,00 €", Some("-20%")),
            event("Plein tarif A", "Lyon", "10,00 €", None),
            event("Promo B", "Lyon", "10,00 €", Some("-50%")),
            event("Plein tarif B", "Lyon", "10,00 €", None),
        ];

        let sorted = TCVModels::sort_events(events, Some(SortKey::DiscountedFirst)).unwrap();
        let titles: Vec<&str> = sorted.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(titles, ["Promo A", "Promo B", "Plein tarif A", "Plein tarif B"]);
    }

    #[test]
    fn unrecognized_sort_key_returns_input_unchanged() {
        assert_eq!(SortKey::parse("par-ordre-alphabetique"), None);

        let events = vec![
            event("Premier", "Lyon", "12,50 €", None),
            event("Second", "Lyon", "5,00 €", None),
        ];

        let sorted = TCVModels::sort_events(events, SortKey::parse("par-ordre-alphabetique")).unwrap();
        assert_eq!(sorted[0].title, "Premier");
        assert_eq!(sorted[1].title, "Second");
    }

    #[test]
    fn soonest_end_date_first_orders_chronologically() {
        let mut later = event("Plus tard", "Lyon", "10,00 €", None);
        later.end_date = "2031-06-01".to_string();
        let mut sooner = event("Bientôt fini", "Lyon", "10,00 €", None);
        sooner.end_date = "2031-05-11".to_string();

        let sorted =
            TCVModels::sort_events(vec![later, sooner], Some(SortKey::SoonestEndDateFirst)).unwrap();
        assert_eq!(sorted[0].title, "Bientôt fini");
    }

    #[test]
    fn soonest_start_date_first_orders_chronologically() {
        let mut later = event("Rentrée", "Lyon", "10,00 €", None);
        later.start_date = "2031-09-01".to_string();
        let mut sooner = event("Cet été", "Lyon", "10,00 €", None);
        sooner.start_date = "2031-07-01".to_string();

        let sorted =
            TCVModels::sort_events(vec![later, sooner], Some(SortKey::SoonestStartDateFirst))
                .unwrap();
        assert_eq!(sorted[0].title, "Cet été");
    }

    #[test]
    fn map_defaults_to_france_center_when_empty() {
        let view = TCVModels::build_map(&[], None);
        assert_eq!(view.center_latitude, 46.2276);
        assert_eq!(view.center_longitude, 2.2137);
        assert_eq!(view.zoom, 6);
        assert!(view.markers.is_empty());
    }

    #[test]
    fn map_centers_on_mean_of_event_coordinates() {
        let mut north = event("Nord", "Lille", "10,00 €", None);
        north.latitude = 50.0;
        north.longitude = 3.0;
        let mut south = event("Sud", "Marseille", "10,00 €", None);
        south.latitude = 43.0;
        south.longitude = 5.0;

        let view = TCVModels::build_map(&[north, south], None);
        assert_eq!(view.center_latitude, 46.5);
        assert_eq!(view.center_longitude, 4.0);
        assert!(view.clustered);
        assert_eq!(view.markers.len(), 2);
        assert_eq!(view.markers[0].label, "Nord");
    }

    #[test]
    fn map_centers_on_supplied_location() {
        let lyon = Location {
            city: "Lyon".to_string(),
            latitude: 45.7640,
            longitude: 4.8357,
        };
        let events = vec![event("Opéra", "Lyon", "30,00 €", None)];

        let view = TCVModels::build_map(&events, Some(&lyon));
        assert_eq!(view.center_latitude, 45.7640);
        assert_eq!(view.zoom, 12);
    }

    #[test]
    fn carbon_lookup_matches_both_directions() {
        let table = vec![CarbonFootprint {
            route: "Lyon - Paris (TGV)".to_string(),
            co2_kg: 1.2,
        }];

        let hit = TCVModels::find_carbon_footprint(&table, "Paris", "Lyon");
        assert_eq!(hit.map(|r| r.co2_kg), Some(1.2));

        let hit = TCVModels::find_carbon_footprint(&table, "lyon", "paris");
        assert_eq!(hit.map(|r| r.co2_kg), Some(1.2));

        assert!(TCVModels::find_carbon_footprint(&table, "Paris", "Nice").is_none());
    }

    #[test]
    fn carbon_lookup_takes_first_matching_row() {
        let table = vec![
            CarbonFootprint {
                route: "Paris - Lyon".to_string(),
                co2_kg: 1.2,
            },
            CarbonFootprint {
                route: "Lyon - Paris".to_string(),
                co2_kg: 9.9,
            },
        ];

        let hit = TCVModels::find_carbon_footprint(&table, "Lyon", "Paris");
        assert_eq!(hit.map(|r| r.co2_kg), Some(1.2));
    }

    #[test]
    fn train_results_are_normalized() {
        let results = TCVModels::clean_train_results(SEARCH_CSV).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].price, 44.5);
        assert_eq!(results[0].duration_minutes, 117);
        assert_eq!(results[1].price, 29.0);
        assert_eq!(results[1].duration_minutes, 145);
    }

    #[test]
    fn display_rows_carry_formatted_prices() {
        let results = TCVModels::clean_train_results(SEARCH_CSV).unwrap();
        let rows = TCVModels::to_display_rows(&results);
        assert_eq!(rows[0].price, "44,50 €");
        assert_eq!(rows[0].duration, "1h57m");
    }

    #[test]
    fn trip_report_joins_search_results_and_carbon_footprint() {
        let today = NaiveDate::from_ymd_opt(2031, 5, 1).unwrap();
        let concert = event("Nuit du jazz", "Lyon", "25,00 €", None);
        let carbon = vec![CarbonFootprint {
            route: "Lyon - Paris".to_string(),
            co2_kg: 1.2,
        }];
        let searcher = FixedSearch { csv: SEARCH_CSV };

        let report = TCVModels::build_trip_report(
            &concert,
            "Paris",
            &SearchWindow::default(),
            &searcher,
            &carbon,
            today,
        );

        assert_eq!(report.results.len(), 2);
        assert_eq!(report.co2_kg, Some(1.2));
        assert!(report.message.is_none());
        assert!(report.warning.is_none());
        assert_eq!(report.departure_city, "Paris");
        assert_eq!(report.arrival_city, "Lyon");
    }

    #[test]
    fn trip_report_degrades_to_no_results_on_search_failure() {
        let today = NaiveDate::from_ymd_opt(2031, 5, 1).unwrap();
        let concert = event("Nuit du jazz", "Lyon", "25,00 €", None);

        let report = TCVModels::build_trip_report(
            &concert,
            "Paris",
            &SearchWindow::default(),
            &FailingSearch,
            &[],
            today,
        );

        assert!(report.results.is_empty());
        assert_eq!(report.message.as_deref(), Some(TCVModels::NO_RESULTS_MESSAGE));
    }

    #[test]
    fn trip_report_warns_and_falls_back_on_bad_start_date() {
        let today = NaiveDate::from_ymd_opt(2031, 5, 1).unwrap();
        let mut concert = event("Nuit du jazz", "Lyon", "25,00 €", None);
        concert.start_date = "prochainement".to_string();

        struct CaptureQuery;
        impl TrainSearch for CaptureQuery {
            fn search(&self, query: &TrainQuery) -> Result<String> {
                assert!(query.from_date.starts_with("01/05/2031"));
                Ok(String::new())
            }
        }

        let report = TCVModels::build_trip_report(
            &concert,
            "Paris",
            &SearchWindow::default(),
            &CaptureQuery,
            &[],
            today,
        );

        assert!(report.warning.is_some());
        assert_eq!(report.message.as_deref(), Some(TCVModels::NO_RESULTS_MESSAGE));
    }

    #[test]
    fn search_window_defaults_to_event_start_date_and_fixed_times() {
        let today = NaiveDate::from_ymd_opt(2031, 5, 1).unwrap();
        let concert = event("Nuit du jazz", "Lyon", "25,00 €", None);

        struct CaptureQuery;
        impl TrainSearch for CaptureQuery {
            fn search(&self, query: &TrainQuery) -> Result<String> {
                assert_eq!(query.from_date, "10/05/2031 08:00");
                assert_eq!(query.to_date, "10/05/2031 16:00");
                assert_eq!(query.departure_station, "Paris");
                assert_eq!(query.arrival_station, "Lyon");
                Ok(String::new())
            }
        }

        TCVModels::build_trip_report(
            &concert,
            "Paris",
            &SearchWindow::default(),
            &CaptureQuery,
            &[],
            today,
        );
    }

    #[test]
    fn departure_cities_exclude_the_destination() {
        let cache = CachedCultureData {
            events: Vec::new(),
            locations: Vec::new(),
            carbon: Vec::new(),
            last_loaded: 0,
        };

        let departures = cache.departure_cities("Lyon");
        assert_eq!(departures.len(), 9);
        assert!(!departures.iter().any(|c| c == "Lyon"));
        assert!(departures.iter().any(|c| c == "Paris"));
    }

    #[test]
    fn end_to_end_clean_filter_and_search() {
        let today = NaiveDate::from_ymd_opt(2031, 5, 1).unwrap();

        let mut past = event("Festival terminé", "Lyon", "10,00 €", None);
        past.end_date = "2031-04-20".to_string();
        let future = event("Nuit du jazz", "Lyon", "25,00 €", None);

        let cleaned = TCVModels::clean_events(vec![past, future], today).unwrap();
        assert_eq!(cleaned.len(), 1);

        let cache = CachedCultureData {
            events: cleaned,
            locations: Vec::new(),
            carbon: vec![CarbonFootprint {
                route: "Lyon - Paris".to_string(),
                co2_kg: 1.2,
            }],
            last_loaded: 0,
        };

        let selected = cache.event_by_title("Lyon", "Nuit du jazz").unwrap().clone();
        let departures = cache.departure_cities(&selected.city);
        let departure = departures.first().unwrap().clone();

        let report = TCVModels::build_trip_report(
            &selected,
            &departure,
            &SearchWindow::default(),
            &FixedSearch { csv: SEARCH_CSV },
            &cache.carbon,
            today,
        );

        assert_eq!(report.results.len(), 2);
        assert!(report.message.is_none());
    }

    #[test]
    fn stats_count_distinct_cities() {
        let cache = CachedCultureData {
            events: vec![
                event("A", "Lyon", "10,00 €", None),
                event("B", "Lyon", "10,00 €", None),
                event("C", "Paris", "10,00 €", None),
            ],
            locations: Vec::new(),
            carbon: Vec::new(),
            last_loaded: 0,
        };

        let stats = cache.stats();
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.total_cities, 2);
    }
}
