mod tests_drain;
