pub mod build;
pub mod images;
pub mod import;
pub mod inspect;
pub mod pull;
pub mod rmi;
pub mod run;
