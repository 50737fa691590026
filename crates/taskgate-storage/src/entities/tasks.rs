use sea_orm::entity::prelude::*;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "tasks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub task_id: String,
    pub channel_id: i64,
    pub platform: String,
    pub user_id: i64,
    pub token_id: Option<i64>,
    pub action: String,
    pub model: String,
    pub status: String,
    pub progress: String,
    #[sea_orm(column_type = "Text")]
    pub request_payload: String,
    #[sea_orm(column_type = "Text")]
    pub task_data: String,
    #[sea_orm(column_type = "Text")]
    pub result_url: String,
    #[sea_orm(column_type = "Text")]
    pub fail_reason: String,
    pub quota: i64,
    pub charged: bool,
    pub submit_time: i64,
    pub start_time: i64,
    pub finish_time: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ActiveModelBehavior for ActiveModel {}
