pub mod virtool_app;
