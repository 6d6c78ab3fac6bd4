pub mod account_repository;
pub mod mock_db;
pub mod mock_webhook_event_repository;
pub mod postgres_account_repository;
pub mod postgres_subscription_history_repository;
pub mod postgres_webhook_event_repository;
pub mod subscription_history_repository;
pub mod webhook_event_repository;
