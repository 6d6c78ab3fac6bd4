pub mod account;
pub mod subscription_action;
pub mod webhook_event;
