mod common;
mod reconcile_pass;
