pub mod primary_store;
