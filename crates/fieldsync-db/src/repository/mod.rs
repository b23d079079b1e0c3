//! # Repository Module
//!
//! One repository per record type, each holding a clone of the pool.
//!
//! ## Available Repositories
//!
//! - [`recording::RecordingRepository`] - keyed by `(name, device)`
//! - [`event::EventRepository`] - keyed by `(key, device)`
//! - [`location::LocationRepository`] - keyed by local id, unique server id
//! - [`reference_image::ReferenceImageRepository`] - keyed by
//!   `(device_id, is_prod_environment, image_type)`

pub mod event;
pub mod location;
pub mod recording;
pub mod reference_image;
