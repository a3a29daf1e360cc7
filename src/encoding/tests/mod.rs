mod tests_limits;
mod tests_wire_format;
