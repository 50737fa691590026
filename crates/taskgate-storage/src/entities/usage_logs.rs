use sea_orm::entity::prelude::*;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "usage_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: i64,
    pub username: String,
    pub created_at: i64,
    #[sea_orm(column_name = "type")]
    pub log_type: i32,
    #[sea_orm(column_type = "Text")]
    pub content: String,
    pub token_name: String,
    pub model_name: String,
    pub quota: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub use_time: i64,
    pub is_stream: bool,
    pub channel_id: i64,
    pub token_id: i64,
    pub group: String,
    pub ip: String,
}

impl ActiveModelBehavior for ActiveModel {}
