pub mod tasks;
pub mod tokens;
pub mod usage_logs;
pub mod users;

pub use tasks::Entity as Tasks;
pub use tokens::Entity as Tokens;
pub use usage_logs::Entity as UsageLogs;
pub use users::Entity as Users;
