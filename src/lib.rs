//! Host-side driver and decoder for MTK-based GPS track loggers (the
//! QStarz BT-Q1300ST and its many relatives). Talks PMTK over a serial
//! line, downloads the raw flash log image, decodes the sector-structured
//! binary format into track/waypoint records, and writes GPX or KML.

pub mod config;
pub mod datalog;
pub mod gpx;
pub mod kml;
pub mod memory;
pub mod models;
pub mod packet;
pub mod probe;
pub mod session;
pub mod transport;
