use axum::{
    async_trait,
    extract::{FromRequest, Request},
    http::StatusCode,
    Json,
};
use serde::{de::DeserializeOwned, Deserialize};
use utoipa::ToSchema;
use validator::Validate;

#[derive(Debug, ToSchema, Validate, Deserialize)]
pub struct RegisterSchema {
    #[validate(length(min = 3, max = 32))]
    pub username: String,
    #[validate(length(min = 8, max = 128))]
    pub password: String,
    #[validate(length(min = 1, max = 64))]
    pub display_name: String,
}

#[derive(Debug, ToSchema, Validate, Deserialize)]
pub struct LoginSchema {
    pub username: String,
    pub password: String,
}

#[derive(Debug, ToSchema, Validate, Deserialize)]
pub struct CreateRoomSchema {
    #[validate(length(min = 1, max = 64))]
    pub name: String,
    #[validate(length(min = 1, max = 128))]
    pub password: Option<String>,
    #[validate(range(min = 2, max = 100))]
    pub max_members: Option<i32>,
    #[validate(range(min = 0.5, max = 1.0))]
    pub mutiny_threshold: Option<f64>,
    #[validate(range(min = 0, max = 60))]
    pub dj_cooldown_minutes: Option<i32>,
    pub auto_randomize_dj: Option<bool>,
}

#[derive(Debug, ToSchema, Validate, Deserialize)]
pub struct JoinRoomSchema {
    pub password: Option<String>,
}

#[derive(Debug, ToSchema, Validate, Deserialize)]
pub struct UpdateSettingsSchema {
    #[validate(range(min = 2, max = 100))]
    pub max_members: Option<i32>,
    #[validate(range(min = 0.5, max = 1.0))]
    pub mutiny_threshold: Option<f64>,
    #[validate(range(min = 0, max = 60))]
    pub dj_cooldown_minutes: Option<i32>,
    pub auto_randomize_dj: Option<bool>,
}

pub struct ValidatedJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Validate,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let extracted_json: Json<T> = Json::from_request(req, state)
            .await
            .map_err(|_| (StatusCode::BAD_REQUEST, "JSON parse failed"))?;

        extracted_json
            .0
            .validate()
            .map_err(|_| (StatusCode::BAD_REQUEST, "Request body is invalid"))?;

        Ok(Self(extracted_json.0))
    }
}
