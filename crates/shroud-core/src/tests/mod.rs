mod compat;
mod stress;
