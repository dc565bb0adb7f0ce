pub mod control_handler;
pub mod controller;
pub mod facade;
pub mod service;
