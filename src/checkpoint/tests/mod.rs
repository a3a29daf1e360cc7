mod helpers;

mod tests_properties;
mod tests_value_file;
