pub mod custom_domains;
