use actix_web::{web, HttpResponse};

pub mod conversations;
pub mod messages;
pub mod wsroute;

async fn health() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

/// Register every HTTP and WebSocket endpoint
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(conversations::list_conversations)
        .service(conversations::create_conversation)
        .service(conversations::find_or_create_conversation)
        .service(conversations::create_group)
        .service(conversations::create_with_message)
        .service(conversations::get_conversation)
        .service(conversations::update_conversation)
        .service(conversations::replace_participants)
        .service(messages::get_messages)
        .service(messages::send_message)
        .service(messages::unread_count)
        .service(messages::mark_read)
        .service(wsroute::ws_handler)
        .service(crate::metrics::metrics_handler)
        .route("/health", web::get().to(health));
}
