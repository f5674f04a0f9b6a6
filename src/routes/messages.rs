use crate::{
    error::AppError, middleware::guards::User, models::SendMessageOptions, state::AppState,
};
use actix_web::{get, post, web, HttpResponse};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(flatten)]
    pub options: SendMessageOptions,
}

#[derive(Serialize)]
pub struct UnreadCountResponse {
    pub count: i64,
}

/// Oldest first, each with its read receipts
#[get("/api/v1/conversations/{id}/messages")]
pub async fn get_messages(
    state: web::Data<AppState>,
    user: User,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let messages = state
        .service
        .list_messages(path.into_inner(), user.id)
        .await?;
    Ok(HttpResponse::Ok().json(messages))
}

#[post("/api/v1/conversations/{id}/messages")]
pub async fn send_message(
    state: web::Data<AppState>,
    user: User,
    path: web::Path<Uuid>,
    body: web::Json<SendMessageRequest>,
) -> Result<HttpResponse, AppError> {
    let body = body.into_inner();
    let message = state
        .service
        .send_message(path.into_inner(), user.id, &body.content, body.options)
        .await?;
    Ok(HttpResponse::Created().json(message))
}

#[post("/api/v1/messages/{id}/read")]
pub async fn mark_read(
    state: web::Data<AppState>,
    user: User,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let receipt = state.service.mark_read(path.into_inner(), user.id).await?;
    Ok(HttpResponse::Ok().json(receipt))
}

#[get("/api/v1/messages/unread-count")]
pub async fn unread_count(
    state: web::Data<AppState>,
    user: User,
) -> Result<HttpResponse, AppError> {
    let count = state.service.get_unread_count(user.id).await?;
    Ok(HttpResponse::Ok().json(UnreadCountResponse { count }))
}
