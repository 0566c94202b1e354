//! 多数据库 SQL 批量执行：查询任务引擎与 Web API

pub mod api;
pub mod config;
pub mod db;
pub mod models;
pub mod services;
pub mod utils;
