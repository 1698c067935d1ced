pub mod audio;
pub mod rss;
