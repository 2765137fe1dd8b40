// Backend API server with embedded frontend
// Train & Culture Voyage: concert dashboard for the big French cities,
// with train ticket search and carbon footprint per route

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpResponse, HttpServer};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

mod tcv_models;
use tcv_models::{
    CachedCultureData, SearchWindow, SessionState, SortKey, TCVModels, TrainSearch,
    TrainlineClient, TripReport,
};

// Embed static files at compile time
const INDEX_HTML: &str = include_str!("../static/tcvweb.html");
const VOYAGE_JS: &str = include_str!("../static/tcv-voyage.js");

#[derive(Clone)]
struct AppState {
    cache: Arc<Mutex<CachedCultureData>>,
    session: Arc<Mutex<SessionState>>,
    searcher: Arc<dyn TrainSearch>,
    data_dir: PathBuf,
}

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
    timestamp: i64,
    sources: Vec<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        ApiResponse {
            success: true,
            data: Some(data),
            error: None,
            timestamp: TCVModels::get_current_timestamp(),
            sources: vec!["OpenAgenda".to_string(), "Trainline".to_string()],
        }
    }

    fn error(message: String) -> Self {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message),
            timestamp: TCVModels::get_current_timestamp(),
            sources: vec![],
        }
    }
}

#[derive(Deserialize)]
struct EventsQuery {
    sort: Option<String>,
}

#[derive(Deserialize)]
struct TripSearchRequest {
    city: String,
    event_title: String,
    departure_city: String,
    #[serde(flatten)]
    window: SearchWindow,
}

// ============================================================================
// Frontend Routes
// ============================================================================

async fn serve_index() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(INDEX_HTML)
}

async fn serve_js() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("application/javascript; charset=utf-8")
        .body(VOYAGE_JS)
}

// ============================================================================
// API Endpoints
// ============================================================================

async fn get_events(state: web::Data<AppState>) -> HttpResponse {
    match state.cache.lock() {
        Ok(cache) => {
            println!("🎭 Events requested: {} upcoming", cache.events.len());
            HttpResponse::Ok().json(ApiResponse::success(cache.events.clone()))
        }
        Err(e) => {
            eprintln!("❌ Failed to lock cache: {}", e);
            HttpResponse::InternalServerError().json(ApiResponse::<String>::error(
                "Failed to retrieve events".to_string(),
            ))
        }
    }
}

async fn get_city_events(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<EventsQuery>,
) -> HttpResponse {
    let city = path.into_inner();

    let city_events = match state.cache.lock() {
        Ok(cache) => cache.city_events(&city),
        Err(e) => {
            eprintln!("❌ Failed to lock cache: {}", e);
            return HttpResponse::InternalServerError().json(ApiResponse::<String>::error(
                "Failed to retrieve events".to_string(),
            ));
        }
    };

    if city_events.is_empty() {
        println!("⚠️  No events for city: {}", city);
        return HttpResponse::NotFound().json(ApiResponse::<String>::error(format!(
            "Aucun événement trouvé pour la ville sélectionnée : {}",
            city
        )));
    }

    if let Ok(mut session) = state.session.lock() {
        session.selected_city = Some(city.clone());
    }

    // An unrecognized sort key leaves the table order untouched
    let key = query.sort.as_deref().and_then(SortKey::parse);
    match TCVModels::sort_events(city_events, key) {
        Ok(sorted) => {
            println!("🎭 Events for {}: {} rows", city, sorted.len());
            HttpResponse::Ok().json(ApiResponse::success(sorted))
        }
        Err(e) => {
            eprintln!("❌ Failed to sort events for {}: {}", city, e);
            HttpResponse::InternalServerError().json(ApiResponse::<String>::error(format!(
                "Failed to sort events: {}",
                e
            )))
        }
    }
}

async fn get_cities(state: web::Data<AppState>) -> HttpResponse {
    match state.cache.lock() {
        Ok(cache) => {
            println!("🏙️  Cities requested: {} destinations", cache.locations.len());
            HttpResponse::Ok().json(ApiResponse::success(cache.locations.clone()))
        }
        Err(e) => {
            eprintln!("❌ Failed to lock cache: {}", e);
            HttpResponse::InternalServerError().json(ApiResponse::<String>::error(
                "Failed to retrieve cities".to_string(),
            ))
        }
    }
}

async fn get_map(state: web::Data<AppState>) -> HttpResponse {
    match state.cache.lock() {
        Ok(cache) => {
            let view = TCVModels::build_map(&cache.events, None);
            println!("🗺️  Map requested: {} markers", view.markers.len());
            HttpResponse::Ok().json(ApiResponse::success(view))
        }
        Err(e) => {
            eprintln!("❌ Failed to lock cache: {}", e);
            HttpResponse::InternalServerError().json(ApiResponse::<String>::error(
                "Failed to build map".to_string(),
            ))
        }
    }
}

async fn get_city_map(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let city = path.into_inner();

    match state.cache.lock() {
        Ok(cache) => {
            let Some(location) = cache.location_of(&city).cloned() else {
                println!("⚠️  Unknown city for map: {}", city);
                return HttpResponse::NotFound().json(ApiResponse::<String>::error(format!(
                    "Ville inconnue : {}",
                    city
                )));
            };

            let city_events = cache.city_events(&city);
            let view = TCVModels::build_map(&city_events, Some(&location));
            println!("🗺️  Map for {}: {} markers", city, view.markers.len());
            HttpResponse::Ok().json(ApiResponse::success(view))
        }
        Err(e) => {
            eprintln!("❌ Failed to lock cache: {}", e);
            HttpResponse::InternalServerError().json(ApiResponse::<String>::error(
                "Failed to build map".to_string(),
            ))
        }
    }
}

async fn get_departure_cities(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let city = path.into_inner();

    match state.cache.lock() {
        Ok(cache) => {
            let departures = cache.departure_cities(&city);
            HttpResponse::Ok().json(ApiResponse::success(departures))
        }
        Err(e) => {
            eprintln!("❌ Failed to lock cache: {}", e);
            HttpResponse::InternalServerError().json(ApiResponse::<String>::error(
                "Failed to retrieve departure cities".to_string(),
            ))
        }
    }
}

async fn get_stats(state: web::Data<AppState>) -> HttpResponse {
    match state.cache.lock() {
        Ok(cache) => {
            println!("📊 Stats requested");
            HttpResponse::Ok().json(ApiResponse::success(cache.stats()))
        }
        Err(e) => {
            eprintln!("❌ Failed to lock cache: {}", e);
            HttpResponse::InternalServerError().json(ApiResponse::<String>::error(
                "Failed to retrieve stats".to_string(),
            ))
        }
    }
}

async fn search_trips(
    state: web::Data<AppState>,
    request: web::Json<TripSearchRequest>,
) -> HttpResponse {
    let request = request.into_inner();

    let (event, carbon) = match state.cache.lock() {
        Ok(cache) => {
            let Some(event) = cache.event_by_title(&request.city, &request.event_title).cloned()
            else {
                println!("⚠️  Event not found: {} ({})", request.event_title, request.city);
                return HttpResponse::NotFound().json(ApiResponse::<String>::error(format!(
                    "Événement « {} » introuvable à {}",
                    request.event_title, request.city
                )));
            };
            (event, cache.carbon.clone())
        }
        Err(e) => {
            eprintln!("❌ Failed to lock cache: {}", e);
            return HttpResponse::InternalServerError().json(ApiResponse::<String>::error(
                "Failed to search trips".to_string(),
            ));
        }
    };

    println!(
        "🎫 Train search: {} -> {} for « {} »",
        request.departure_city, event.city, event.title
    );

    let searcher = state.searcher.clone();
    let departure_city = request.departure_city.clone();
    let window = request.window.clone();

    let report = match tokio::task::spawn_blocking(move || {
        let today = Local::now().date_naive();
        TCVModels::build_trip_report(
            &event,
            &departure_city,
            &window,
            searcher.as_ref(),
            &carbon,
            today,
        )
    })
    .await
    {
        Ok(report) => report,
        Err(e) => {
            eprintln!("❌ Train search task panicked: {}", e);
            return HttpResponse::InternalServerError().json(ApiResponse::<String>::error(
                "Train search task panicked".to_string(),
            ));
        }
    };

    match state.session.lock() {
        Ok(mut session) => {
            session.selected_city = Some(request.city);
            session.selected_event = Some(request.event_title);
            session.selected_departure_city = Some(request.departure_city);
            session.last_report = Some(report.clone());
        }
        Err(e) => {
            eprintln!("⚠️  Failed to lock session, report not kept: {}", e);
        }
    }

    HttpResponse::Ok().json(ApiResponse::success(report))
}

async fn get_last_trip(state: web::Data<AppState>) -> HttpResponse {
    match state.session.lock() {
        Ok(session) => {
            let report = session.last_report.clone().unwrap_or_else(|| {
                TripReport::no_results(
                    session.selected_departure_city.as_deref().unwrap_or(""),
                    session.selected_city.as_deref().unwrap_or(""),
                    None,
                )
            });
            HttpResponse::Ok().json(ApiResponse::success(report))
        }
        Err(e) => {
            eprintln!("❌ Failed to lock session: {}", e);
            HttpResponse::InternalServerError().json(ApiResponse::<String>::error(
                "Failed to retrieve last search".to_string(),
            ))
        }
    }
}

async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "Train & Culture Voyage API",
        "version": "1.0.0",
        "sources": ["OpenAgenda", "Trainline"],
        "timestamp": TCVModels::get_current_timestamp(),
        "embedded_frontend": true
    }))
}

async fn force_refresh(state: web::Data<AppState>) -> HttpResponse {
    println!("🔄 Manual refresh requested...");

    let cache = state.cache.clone();
    let data_dir = state.data_dir.clone();
    match tokio::task::spawn_blocking(move || match cache.lock() {
        Ok(mut cache) => {
            TCVModels::reload_cache(&mut cache, &data_dir);
            Ok(())
        }
        Err(e) => Err(format!("Failed to lock cache: {}", e)),
    })
    .await
    {
        Ok(Ok(())) => {
            println!("✓ Manual refresh completed successfully");
            HttpResponse::Ok().json(ApiResponse::success("Data refreshed successfully"))
        }
        Ok(Err(e)) => {
            eprintln!("⚠️  Manual refresh failed: {}", e);
            HttpResponse::InternalServerError()
                .json(ApiResponse::<String>::error(format!("Refresh failed: {}", e)))
        }
        Err(e) => {
            eprintln!("❌ Manual refresh task panicked: {}", e);
            HttpResponse::InternalServerError().json(ApiResponse::<String>::error(
                "Refresh task panicked".to_string(),
            ))
        }
    }
}

// ============================================================================
// Server Setup
// ============================================================================

async fn run_server(cache: CachedCultureData, data_dir: PathBuf) -> std::io::Result<()> {
    let app_state = AppState {
        cache: Arc::new(Mutex::new(cache)),
        session: Arc::new(Mutex::new(SessionState::default())),
        searcher: Arc::new(TrainlineClient::from_env()),
        data_dir,
    };

    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║   🚄 Train & Culture Voyage Server (Embedded UI)           ║");
    println!("╚════════════════════════════════════════════════════════════╝\n");
    println!("🌐 Server running on: http://0.0.0.0:8080");
    println!("📱 Web UI available at: http://localhost:8080");
    println!("📡 API available at: http://localhost:8080/api/culture\n");

    println!("📍 Available Routes:");
    println!("┌─────────────────────────────────────────────────────────────┐");
    println!("│ Frontend:                                                   │");
    println!("│   GET  /                             - Web UI (embedded)    │");
    println!("│   GET  /tcv-voyage.js                - JavaScript (embedded)│");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ API - Events & Cities:                                      │");
    println!("│   GET  /api/culture/events           - All upcoming events  │");
    println!("│   GET  /api/culture/events/:city     - City events (?sort=) │");
    println!("│   GET  /api/culture/cities           - Destination cities   │");
    println!("│   GET  /api/culture/departures/:city - Departure choices    │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ API - Map:                                                  │");
    println!("│   GET  /api/culture/map              - Map of all events    │");
    println!("│   GET  /api/culture/map/:city        - Map centered on city │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ API - Train Tickets:                                        │");
    println!("│   POST /api/culture/trips/search     - Search train tickets │");
    println!("│   GET  /api/culture/trips/last       - Last search results  │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ API - Meta & Control:                                       │");
    println!("│   GET  /api/culture/stats            - Dataset statistics   │");
    println!("│   POST /api/culture/refresh          - Reload CSV data      │");
    println!("│   GET  /health                       - Health check         │");
    println!("└─────────────────────────────────────────────────────────────┘\n");

    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            // Frontend routes
            .route("/", web::get().to(serve_index))
            .route("/tcv-voyage.js", web::get().to(serve_js))
            // Health check
            .route("/health", web::get().to(health_check))
            // API routes
            .service(
                web::scope("/api/culture")
                    .route("/events", web::get().to(get_events))
                    .route("/events/{city}", web::get().to(get_city_events))
                    .route("/cities", web::get().to(get_cities))
                    .route("/departures/{city}", web::get().to(get_departure_cities))
                    .route("/map", web::get().to(get_map))
                    .route("/map/{city}", web::get().to(get_city_map))
                    .route("/trips/search", web::post().to(search_trips))
                    .route("/trips/last", web::get().to(get_last_trip))
                    .route("/stats", web::get().to(get_stats))
                    .route("/refresh", web::post().to(force_refresh)),
            )
    })
    .bind(("0.0.0.0", 8080))?
    .run()
    .await
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> std::io::Result<()> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║                                                            ║");
    println!("║    🚄 Train & Culture Voyage Server                        ║");
    println!("║       with Embedded Web UI                                 ║");
    println!("║                                                            ║");
    println!("║    Planifier son voyage culturel dans les grandes          ║");
    println!("║    villes françaises, selon son budget                     ║");
    println!("║                                                            ║");
    println!("╚════════════════════════════════════════════════════════════╝\n");

    let data_dir =
        PathBuf::from(std::env::var("TCV_DATA_DIR").unwrap_or_else(|_| "data".to_string()));

    // Missing or broken files degrade to empty tables; the dashboard then
    // shows "nothing to display" instead of refusing to start.
    let cache = TCVModels::initialize_cache(&data_dir);

    let stats = cache.stats();
    println!("\n✓ Cache initialized!");
    println!(
        "  • {} upcoming events in {} cities",
        stats.total_events, stats.total_cities
    );
    println!("  • {} carbon footprint routes", stats.carbon_routes);
    println!(
        "  • Loaded at {}",
        TCVModels::format_timestamp_full(stats.last_loaded as i64)
    );

    actix_web::rt::System::new().block_on(run_server(cache, data_dir))
}
