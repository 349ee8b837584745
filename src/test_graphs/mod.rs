#![cfg(test)]

mod diamond_structure;
mod y_structure;
